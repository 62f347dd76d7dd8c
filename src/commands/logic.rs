//! Pure decision functions extracted from the handlers.
//!
//! These take plain parameters (no service state) and can be unit-tested without a
//! runtime or host doubles.

use serde_json::Value;

use crate::config;
use crate::core::{FeatureSettings, SettingKey};
use crate::error::AppError;
use crate::host::messages::HttpHeader;

/// Resolve a requested key name, accepting legacy aliases.
pub fn parse_setting_key(name: &str) -> Result<SettingKey, AppError> {
    SettingKey::parse(name)
        .ok_or_else(|| AppError::InvalidSettingValue(format!("unknown setting key {name:?}")))
}

/// The update a control-panel redirect toggle stands for.
pub fn toggle_redirect_update(enabled: bool) -> (SettingKey, Value) {
    (SettingKey::LinkRewrite, Value::Bool(enabled))
}

/// Byte count from the first `content-length` header, matched case-insensitively.
pub fn parse_content_length(headers: &[HttpHeader]) -> Result<u64, AppError> {
    let header = headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(config::CONTENT_LENGTH_HEADER))
        .ok_or_else(|| AppError::MalformedUsageHint("no content-length header".into()))?;

    let raw = header
        .value
        .as_deref()
        .ok_or_else(|| AppError::MalformedUsageHint("content-length has no value".into()))?;

    raw.trim()
        .parse::<u64>()
        .map_err(|_| AppError::MalformedUsageHint(format!("content-length {raw:?} is not a byte count")))
}

/// The new `audioOnlyMode` value if it differs between the two records.
pub fn audio_only_transition(previous: &FeatureSettings, current: &FeatureSettings) -> Option<bool> {
    (previous.audio_only_mode != current.audio_only_mode).then_some(current.audio_only_mode)
}

/// Whether a channel name identifies a usage subscriber.
pub fn is_usage_port(name: &str) -> bool {
    name == config::DATA_USAGE_PORT_NAME
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Vec<HttpHeader> {
        pairs.iter().map(|(n, v)| HttpHeader::new(n, v)).collect()
    }

    #[test]
    fn test_parse_content_length_case_insensitive() {
        let h = headers(&[("Content-Type", "text/html"), ("Content-Length", "1200")]);
        assert_eq!(parse_content_length(&h).unwrap(), 1200);
        assert_eq!(parse_content_length(&headers(&[("CONTENT-LENGTH", " 42 ")])).unwrap(), 42);
    }

    #[test]
    fn test_parse_content_length_missing_header() {
        let err = parse_content_length(&headers(&[("Content-Type", "text/html")])).unwrap_err();
        assert_eq!(err.kind(), "MalformedUsageHint");
        assert!(parse_content_length(&[]).is_err());
    }

    #[test]
    fn test_parse_content_length_rejects_non_numeric() {
        for bad in ["abc", "-5", "1.5", "", "12 34"] {
            let err = parse_content_length(&headers(&[("content-length", bad)])).unwrap_err();
            assert_eq!(err.kind(), "MalformedUsageHint", "value {bad:?}");
        }
    }

    #[test]
    fn test_parse_content_length_header_without_value() {
        let h = vec![HttpHeader {
            name: "content-length".into(),
            value: None,
        }];
        assert!(parse_content_length(&h).is_err());
    }

    #[test]
    fn test_parse_content_length_zero_is_valid() {
        assert_eq!(parse_content_length(&headers(&[("content-length", "0")])).unwrap(), 0);
    }

    #[test]
    fn test_parse_setting_key_rejects_unknown() {
        assert_eq!(parse_setting_key("youtubeAudioOnly").unwrap(), SettingKey::AudioOnlyMode);
        assert_eq!(parse_setting_key("darkMode").unwrap_err().kind(), "InvalidSettingValue");
    }

    #[test]
    fn test_toggle_redirect_targets_link_rewrite() {
        assert_eq!(
            toggle_redirect_update(false),
            (SettingKey::LinkRewrite, Value::Bool(false))
        );
    }

    #[test]
    fn test_audio_only_transition() {
        let off = FeatureSettings::default();
        let on = FeatureSettings {
            audio_only_mode: true,
            ..FeatureSettings::default()
        };
        let link_off = FeatureSettings {
            link_rewrite: false,
            ..FeatureSettings::default()
        };
        assert_eq!(audio_only_transition(&off, &on), Some(true));
        assert_eq!(audio_only_transition(&on, &off), Some(false));
        assert_eq!(audio_only_transition(&off, &link_off), None);
    }

    #[test]
    fn test_is_usage_port() {
        assert!(is_usage_port("data_usage_port"));
        assert!(!is_usage_port("settings_port"));
    }
}
