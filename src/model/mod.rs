use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod error;

/// CMCD `ot` token. Only video and muxed audio/video objects are rate controlled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Video,
    Audio,
    Av,
    Other,
}

impl ObjectType {
    pub fn from_token(token: &str) -> Self {
        match token {
            "v" => ObjectType::Video,
            "a" => ObjectType::Audio,
            "av" => ObjectType::Av,
            _ => ObjectType::Other,
        }
    }

    pub fn is_rate_controlled(self) -> bool {
        matches!(self, ObjectType::Video | ObjectType::Av)
    }
}

/// Client telemetry for a single request, normalized to seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CmcdParams {
    pub buffer_length: f64,
    pub buffer_min: f64,
    pub buffer_max: f64,
    pub object_type: ObjectType,
    pub next_bitrate: f64,
    pub seg_duration: f64,
    pub measured_throughput: f64,
    pub session_id: Option<String>,
    pub device_id: Option<String>,
}

impl CmcdParams {
    /// Time the next segment takes to download at the client's measured throughput.
    pub fn expected_seg_download_time(&self) -> f64 {
        self.next_bitrate * self.seg_duration / self.measured_throughput
    }

    pub fn buffer_case(&self) -> BufferCase {
        if self.buffer_length < self.buffer_min {
            BufferCase::Critical
        } else if self.buffer_length > self.buffer_max {
            BufferCase::Surplus
        } else {
            BufferCase::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferCase {
    Critical,
    Surplus,
    Normal,
}

/// Shared delay debt. Decays by one second per elapsed second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DelayState {
    pub latest_delay: f64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub latest_delay_timestamp: DateTime<Utc>,
}

impl Default for DelayState {
    fn default() -> Self {
        DelayState {
            latest_delay: 0.0,
            latest_delay_timestamp: DateTime::UNIX_EPOCH,
        }
    }
}

impl DelayState {
    pub fn new(latest_delay: f64, latest_delay_timestamp: DateTime<Utc>) -> Self {
        DelayState {
            latest_delay,
            latest_delay_timestamp,
        }
    }

    /// Debt left at `now`. A `now` earlier than the record (clock skew) counts as no time passed.
    pub fn current_delay(&self, now: DateTime<Utc>) -> f64 {
        let elapsed = (now - self.latest_delay_timestamp).num_milliseconds().max(0) as f64 / 1000.0;
        (self.latest_delay - elapsed).max(0.0)
    }

    /// A debt the shaper can actually sleep for: non-negative and representable as a `Duration`.
    pub fn is_sleepable(delay: f64) -> bool {
        delay >= 0.0 && Duration::try_from_secs_f64(delay).is_ok()
    }

    /// Conditional update: `candidate` replaces `self` only if it exceeds the debt still owed at
    /// the candidate's own timestamp. Unsleepable candidates (NaN, infinite) never land.
    pub fn raise(&self, candidate: DelayState) -> Raise {
        if Self::is_sleepable(candidate.latest_delay)
            && candidate.latest_delay > self.current_delay(candidate.latest_delay_timestamp)
        {
            Raise::Raised(candidate)
        } else {
            Raise::Kept(*self)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Raise {
    Raised(DelayState),
    Kept(DelayState),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingParams,
    NotVideo,
    MalformedParam(String),
    InvalidThresholds,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Decision {
    Controlled {
        case: BufferCase,
        delay: f64,
        state_update: Option<DelayState>,
    },
    Skipped {
        reason: SkipReason,
    },
}

impl Decision {
    pub fn delay(&self) -> f64 {
        match self {
            Decision::Controlled { delay, .. } => *delay,
            Decision::Skipped { .. } => 0.0,
        }
    }

    pub fn state_update(&self) -> Option<DelayState> {
        match self {
            Decision::Controlled { state_update, .. } => *state_update,
            Decision::Skipped { .. } => None,
        }
    }
}

/// Everything that went into one decision, for offline analysis.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<String>,
    pub device_id: Option<String>,
    pub params: Option<CmcdParams>,
    /// Decoded CMCD payload, kept when the request could not be controlled.
    pub raw_cmcd: Option<HashMap<String, String>>,
    pub prior_state: Option<DelayState>,
    pub current_delay: Option<f64>,
    pub expected_seg_download_time: Option<f64>,
    /// Buffer left once the segment arrives after paying the current debt.
    pub expected_buffer_after_delayed_download: Option<f64>,
    pub decision: Decision,
}

impl DecisionRecord {
    pub fn skipped(
        timestamp: DateTime<Utc>,
        reason: SkipReason,
        raw_cmcd: HashMap<String, String>,
    ) -> Self {
        DecisionRecord {
            timestamp,
            session_id: raw_cmcd.get("sid").cloned(),
            device_id: raw_cmcd.get("did").cloned(),
            params: None,
            raw_cmcd: Some(raw_cmcd),
            prior_state: None,
            current_delay: None,
            expected_seg_download_time: None,
            expected_buffer_after_delayed_download: None,
            decision: Decision::Skipped { reason },
        }
    }

    pub fn delay(&self) -> f64 {
        self.decision.delay()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn debt_decays_one_second_per_second() {
        let t = Utc::now();
        let state = DelayState::new(10.0, t);
        assert_eq!(state.current_delay(t + TimeDelta::seconds(3)), 7.0);

        let state = DelayState::new(5.0, t);
        assert_eq!(state.current_delay(t + TimeDelta::seconds(9)), 0.0);
    }

    #[test]
    fn clock_skew_does_not_inflate_debt() {
        let t = Utc::now();
        let state = DelayState::new(4.0, t);
        assert_eq!(state.current_delay(t - TimeDelta::seconds(2)), 4.0);
    }

    #[test]
    fn default_state_owes_nothing() {
        assert_eq!(DelayState::default().current_delay(Utc::now()), 0.0);
    }

    #[test]
    fn raise_only_when_candidate_exceeds_decayed_debt() {
        let t = Utc::now();
        let state = DelayState::new(10.0, t);

        let later = t + TimeDelta::seconds(4);
        assert_eq!(state.raise(DelayState::new(5.0, later)), Raise::Kept(state));
        assert_eq!(state.raise(DelayState::new(6.0, later)), Raise::Kept(state));
        let bigger = DelayState::new(6.5, later);
        assert_eq!(state.raise(bigger), Raise::Raised(bigger));
    }

    #[test]
    fn unsleepable_candidates_never_land() {
        let t = Utc::now();
        let state = DelayState::new(3.0, t);
        for bad in [f64::INFINITY, f64::NAN, 1e300, -1.0] {
            assert_eq!(state.raise(DelayState::new(bad, t)), Raise::Kept(state), "{bad}");
        }
    }

    #[test]
    fn skipped_record_keeps_session_ids() {
        let raw: HashMap<String, String> = [("sid", "s-1"), ("did", "dash.js-v4.2.1"), ("bl", "3")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let record = DecisionRecord::skipped(Utc::now(), SkipReason::MissingParams, raw);
        assert_eq!(record.session_id.as_deref(), Some("s-1"));
        assert_eq!(record.device_id.as_deref(), Some("dash.js-v4.2.1"));
        assert_eq!(record.raw_cmcd.unwrap()["bl"], "3");
        assert_eq!(record.decision.delay(), 0.0);
    }

    #[test]
    fn object_type_tokens() {
        assert!(ObjectType::from_token("v").is_rate_controlled());
        assert!(ObjectType::from_token("av").is_rate_controlled());
        assert!(!ObjectType::from_token("a").is_rate_controlled());
        assert_eq!(ObjectType::from_token("m"), ObjectType::Other);
    }
}
