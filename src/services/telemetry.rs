use crate::model::{Decision, DecisionRecord};

/// Receives exactly one record per handled request.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record(&self, record: &DecisionRecord);
}

/// Emits each record as a structured event on the `cmsd::decision` target.
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record(&self, record: &DecisionRecord) {
        let params = record.params.as_ref();
        let (outcome, case, skip_reason, state_update) = match &record.decision {
            Decision::Controlled {
                case, state_update, ..
            } => ("controlled", Some(*case), None, *state_update),
            Decision::Skipped { reason } => ("skipped", None, Some(reason), None),
        };
        tracing::info!(
            target: "cmsd::decision",
            timestamp = record.timestamp.timestamp_millis(),
            sid = record.session_id.as_deref(),
            did = record.device_id.as_deref(),
            buffer_length = params.map(|p| p.buffer_length),
            buffer_min = params.map(|p| p.buffer_min),
            buffer_max = params.map(|p| p.buffer_max),
            next_bitrate = params.map(|p| p.next_bitrate),
            seg_duration = params.map(|p| p.seg_duration),
            measured_throughput = params.map(|p| p.measured_throughput),
            last_recorded_delay = record.prior_state.map(|s| s.latest_delay),
            last_recorded_delay_ts = record.prior_state.map(|s| s.latest_delay_timestamp.timestamp_millis()),
            current_delay = record.current_delay,
            expected_seg_download_time = record.expected_seg_download_time,
            expected_buffer_after_delayed_download = record.expected_buffer_after_delayed_download,
            outcome,
            case = ?case,
            skip_reason = ?skip_reason,
            delay_update = state_update.map(|s| s.latest_delay),
            delay_update_ts = state_update.map(|s| s.latest_delay_timestamp.timestamp_millis()),
            delay_for_this_req = record.delay(),
            raw_cmcd = ?record.raw_cmcd,
            "decision"
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Keeps records in memory so tests can inspect them.
    #[derive(Debug, Default)]
    pub(crate) struct CollectingSink(pub Mutex<Vec<DecisionRecord>>);

    impl TelemetrySink for CollectingSink {
        fn record(&self, record: &DecisionRecord) {
            self.0.lock().unwrap().push(record.clone());
        }
    }

    #[test]
    fn tracing_sink_accepts_skipped_records() {
        let raw = [("sid", "s-9"), ("ot", "a")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let record = DecisionRecord::skipped(chrono::Utc::now(), crate::model::SkipReason::NotVideo, raw);
        TracingSink.record(&record);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["session_id"], "s-9");
        assert_eq!(json["raw_cmcd"]["ot"], "a");
        assert_eq!(json["decision"]["outcome"], "skipped");
        assert_eq!(json["decision"]["reason"], "not_video");
    }
}
