use chrono::{DateTime, Utc};

use crate::model::{BufferCase, CmcdParams, Decision, DecisionRecord, DelayState, Raise, SkipReason};

use super::cmcd::{self, BufferUnitRules};
use super::i_delay_store::DelayStore;

/// Buffer-based response delay controller.
///
/// A client below its minimum buffer is served immediately and records a debt
/// equal to its expected segment download time. Clients above their maximum
/// buffer pay the whole decayed debt, clients in between pay a share
/// proportional to how far into the healthy range their buffer sits.
#[derive(Debug)]
pub struct DelayEngine<S: DelayStore> {
    store: S,
    unit_rules: BufferUnitRules,
}

impl<S: DelayStore> DelayEngine<S> {
    pub fn new(store: S, unit_rules: BufferUnitRules) -> Self {
        Self { store, unit_rules }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Decides from the raw request query string.
    pub async fn decide_query(&self, query: &str, now: DateTime<Utc>) -> DecisionRecord {
        let map = cmcd::decode(query);
        match cmcd::parse_params(&map, &self.unit_rules) {
            Ok(params) => self.decide(params, now).await,
            Err(reason) => {
                match &reason {
                    SkipReason::InvalidThresholds => tracing::warn!(
                        "client buffer thresholds misconfigured (bmx <= bmn), rate control disabled: {map:?}"
                    ),
                    reason => tracing::debug!("skipping rate control ({reason:?}): {map:?}"),
                }
                DecisionRecord::skipped(now, reason, map)
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn decide(&self, params: CmcdParams, now: DateTime<Utc>) -> DecisionRecord {
        let prior_state = match self.store.read().await {
            Ok(state) if DelayState::is_sleepable(state.latest_delay) => state,
            Ok(state) => {
                tracing::error!("stored delay state {state:?} is out of range, assuming no debt");
                DelayState::default()
            }
            Err(e) => {
                tracing::warn!("delay state unreadable, assuming no debt: {e}");
                DelayState::default()
            }
        };
        let current_delay = prior_state.current_delay(now);
        let expected = params.expected_seg_download_time();
        tracing::debug!("current_delay = {current_delay}s, expected_seg_download_time = {expected}s");

        let case = params.buffer_case();
        let (delay, state_update) = match case {
            BufferCase::Critical => {
                let mut state_update = None;
                if expected > current_delay {
                    match self.store.raise(DelayState::new(expected, now)).await {
                        Ok(Raise::Raised(state)) => state_update = Some(state),
                        Ok(Raise::Kept(state)) => {
                            tracing::debug!("a concurrent claim already dominates: {state:?}")
                        }
                        Err(e) => tracing::error!("failed to record shared delay {expected}s: {e}"),
                    }
                }
                (0.0, state_update)
            }
            BufferCase::Surplus => (current_delay, None),
            BufferCase::Normal => {
                let share = (params.buffer_length - params.buffer_min)
                    / (params.buffer_max - params.buffer_min);
                ((current_delay * share).max(0.0), None)
            }
        };
        tracing::debug!("{case:?} client, serving with delay = {delay}s");

        let buffer_after = (params.buffer_length - expected - current_delay).max(0.0);
        DecisionRecord {
            timestamp: now,
            session_id: params.session_id.clone(),
            device_id: params.device_id.clone(),
            params: Some(params),
            raw_cmcd: None,
            prior_state: Some(prior_state),
            current_delay: Some(current_delay),
            expected_seg_download_time: Some(expected),
            expected_buffer_after_delayed_download: Some(buffer_after),
            decision: Decision::Controlled {
                case,
                delay,
                state_update,
            },
        }
    }
}
