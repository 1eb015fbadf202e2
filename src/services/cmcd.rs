use std::collections::HashMap;

use crate::model::{CmcdParams, DelayState, ObjectType, SkipReason};

pub const CMCD_QUERY_KEY: &str = "CMCD";
pub const CMCD_QUERY_KEY_LONG: &str = "Common-Media-Client-Data";

pub const KEY_BUFFER_LENGTH: &str = "bl";
pub const KEY_BUFFER_MIN: &str = "com.example-bmn";
pub const KEY_BUFFER_MAX: &str = "com.example-bmx";
pub const KEY_OBJECT_TYPE: &str = "ot";
pub const KEY_BITRATE: &str = "br";
pub const KEY_DURATION: &str = "d";
pub const KEY_THROUGHPUT: &str = "mtp";
pub const KEY_SESSION_ID: &str = "sid";
pub const KEY_DEVICE_ID: &str = "did";

const REQUIRED_KEYS: [&str; 7] = [
    KEY_BUFFER_LENGTH,
    KEY_BUFFER_MIN,
    KEY_BUFFER_MAX,
    KEY_OBJECT_TYPE,
    KEY_BITRATE,
    KEY_DURATION,
    KEY_THROUGHPUT,
];

/// Extracts the CMCD payload from a raw query string into a key/value map.
///
/// `Common-Media-Client-Data` wins over `CMCD` when both are present. Valueless
/// flags (e.g. `bs`) map to `"true"`. Returns an empty map when there is no payload.
pub fn decode(query: &str) -> HashMap<String, String> {
    let mut short = None;
    let mut long = None;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            CMCD_QUERY_KEY_LONG => long = Some(value.into_owned()),
            CMCD_QUERY_KEY => short = Some(value.into_owned()),
            _ => {}
        }
    }
    let Some(payload) = long.or(short) else {
        return HashMap::new();
    };

    payload
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| match token.split_once('=') {
            Some((key, value)) => (key.to_string(), unquote(value).to_string()),
            None => (token.to_string(), "true".to_string()),
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// Which players report `bl`, `com.example-bmn` and `com.example-bmx` in
/// milliseconds instead of seconds, matched by fragments of their `did`.
#[derive(Debug, Clone, Default)]
pub struct BufferUnitRules {
    ms_device_patterns: Vec<String>,
}

impl BufferUnitRules {
    pub fn new(patterns: impl IntoIterator<Item = String>) -> Self {
        Self {
            ms_device_patterns: patterns.into_iter().collect(),
        }
    }

    pub fn reports_millis(&self, device_id: Option<&str>) -> bool {
        device_id.is_some_and(|did| {
            self.ms_device_patterns
                .iter()
                .any(|pattern| did.contains(pattern.as_str()))
        })
    }
}

fn number(map: &HashMap<String, String>, key: &str) -> Result<f64, SkipReason> {
    map.get(key)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .ok_or_else(|| SkipReason::MalformedParam(key.to_string()))
}

/// Validates a decoded map and normalizes every duration to seconds.
pub fn parse_params(
    map: &HashMap<String, String>,
    rules: &BufferUnitRules,
) -> Result<CmcdParams, SkipReason> {
    if REQUIRED_KEYS.iter().any(|key| !map.contains_key(*key)) {
        return Err(SkipReason::MissingParams);
    }
    let object_type = ObjectType::from_token(&map[KEY_OBJECT_TYPE]);
    if !object_type.is_rate_controlled() {
        return Err(SkipReason::NotVideo);
    }

    let session_id = map.get(KEY_SESSION_ID).cloned();
    let device_id = map.get(KEY_DEVICE_ID).cloned();
    let buffer_scale = if rules.reports_millis(device_id.as_deref()) {
        1000.0
    } else {
        1.0
    };

    let measured_throughput = number(map, KEY_THROUGHPUT)?;
    if measured_throughput == 0.0 {
        return Err(SkipReason::MalformedParam(KEY_THROUGHPUT.to_string()));
    }

    let params = CmcdParams {
        buffer_length: number(map, KEY_BUFFER_LENGTH)? / buffer_scale,
        buffer_min: number(map, KEY_BUFFER_MIN)? / buffer_scale,
        buffer_max: number(map, KEY_BUFFER_MAX)? / buffer_scale,
        object_type,
        next_bitrate: number(map, KEY_BITRATE)?,
        seg_duration: number(map, KEY_DURATION)? / 1000.0,
        measured_throughput,
        session_id,
        device_id,
    };
    if params.buffer_max <= params.buffer_min {
        return Err(SkipReason::InvalidThresholds);
    }
    // br * d / mtp can overflow even when each field is sane on its own
    if !DelayState::is_sleepable(params.expected_seg_download_time()) {
        return Err(SkipReason::MalformedParam(KEY_BITRATE.to_string()));
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_percent_encoded_payload() {
        let map = decode("CMCD=bl%3D21300%2Cot%3Dv%2Cbs%2Csid%3D%22abc%22");
        assert_eq!(map["bl"], "21300");
        assert_eq!(map["ot"], "v");
        assert_eq!(map["bs"], "true");
        assert_eq!(map["sid"], "abc");
        assert_eq!(map.len(), 4);
    }

    #[test]
    fn prefers_long_key_when_both_present() {
        let map = decode("CMCD=bl%3D1&Common-Media-Client-Data=bl%3D2");
        assert_eq!(map["bl"], "2");
        let map = decode("Common-Media-Client-Data=bl%3D2&CMCD=bl%3D1");
        assert_eq!(map["bl"], "2");
    }

    #[test]
    fn missing_payload_is_empty() {
        assert!(decode("").is_empty());
        assert!(decode("foo=bar").is_empty());
    }

    #[test]
    fn last_duplicate_wins() {
        let map = decode("CMCD=bl%3D1%2Cbl%3D7");
        assert_eq!(map["bl"], "7");
    }

    fn full_map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        let mut map: HashMap<String, String> = [
            ("bl", "10"),
            ("com.example-bmn", "5"),
            ("com.example-bmx", "20"),
            ("ot", "v"),
            ("br", "1000"),
            ("d", "4000"),
            ("mtp", "2000"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in pairs {
            map.insert(k.to_string(), v.to_string());
        }
        map
    }

    #[test]
    fn parses_and_normalizes_segment_duration() {
        let p = parse_params(&full_map(&[]), &BufferUnitRules::default()).unwrap();
        assert_eq!(p.buffer_length, 10.0);
        assert_eq!(p.seg_duration, 4.0);
        assert_eq!(p.expected_seg_download_time(), 2.0);
        assert_eq!(p.object_type, ObjectType::Video);
    }

    #[test]
    fn millisecond_devices_scale_buffer_fields() {
        let rules = BufferUnitRules::new(["dash.js-v4.2.1".to_string()]);
        let map = full_map(&[
            ("bl", "21300"),
            ("com.example-bmn", "5000"),
            ("com.example-bmx", "20000"),
            ("did", "dash.js-v4.2.1"),
        ]);
        let p = parse_params(&map, &rules).unwrap();
        assert_eq!(p.buffer_length, 21.3);
        assert_eq!(p.buffer_min, 5.0);
        assert_eq!(p.buffer_max, 20.0);
    }

    #[test]
    fn any_missing_required_key_skips() {
        for key in REQUIRED_KEYS {
            let mut map = full_map(&[]);
            map.remove(key);
            assert_eq!(
                parse_params(&map, &BufferUnitRules::default()),
                Err(SkipReason::MissingParams),
                "without {key}"
            );
        }
    }

    #[test]
    fn non_video_skips() {
        let map = full_map(&[("ot", "a")]);
        assert_eq!(
            parse_params(&map, &BufferUnitRules::default()),
            Err(SkipReason::NotVideo)
        );
    }

    #[test]
    fn malformed_numbers_skip() {
        let rules = BufferUnitRules::default();
        assert_eq!(
            parse_params(&full_map(&[("br", "fast")]), &rules),
            Err(SkipReason::MalformedParam("br".to_string()))
        );
        assert_eq!(
            parse_params(&full_map(&[("mtp", "0")]), &rules),
            Err(SkipReason::MalformedParam("mtp".to_string()))
        );
        assert_eq!(
            parse_params(&full_map(&[("bl", "-1")]), &rules),
            Err(SkipReason::MalformedParam("bl".to_string()))
        );
    }

    #[test]
    fn overflowing_download_time_skips() {
        let rules = BufferUnitRules::default();
        let huge_bitrate = full_map(&[("bl", "1"), ("br", "1e308"), ("mtp", "1")]);
        assert_eq!(
            parse_params(&huge_bitrate, &rules),
            Err(SkipReason::MalformedParam("br".to_string()))
        );
        let tiny_throughput = full_map(&[("bl", "1"), ("mtp", "5e-324")]);
        assert_eq!(
            parse_params(&tiny_throughput, &rules),
            Err(SkipReason::MalformedParam("br".to_string()))
        );
    }

    #[test]
    fn degenerate_thresholds_are_rejected() {
        let rules = BufferUnitRules::default();
        let map = full_map(&[("com.example-bmn", "20")]);
        assert_eq!(parse_params(&map, &rules), Err(SkipReason::InvalidThresholds));
        let map = full_map(&[("com.example-bmn", "30")]);
        assert_eq!(parse_params(&map, &rules), Err(SkipReason::InvalidThresholds));
    }
}
