//! Closed message types exchanged with UI contexts.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::settings::{FeatureSettings, SettingKey, SettingValue};
use crate::core::usage::TabId;

/// One response header as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeader {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

impl HttpHeader {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: Some(value.to_string()),
        }
    }
}

/// One-shot request from a transient UI context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum RuntimeMessage {
    UpdateSetting {
        key: String,
        value: Value,
    },
    /// The control panel's on/off switch for link rewriting.
    ToggleRedirect {
        enabled: bool,
    },
    GetSettings,
    GetUsage {
        #[serde(rename = "tabId")]
        tab_id: TabId,
    },
}

/// Payload a UI context sends over its usage channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum PortMessage {
    Register {
        #[serde(rename = "tabId")]
        tab_id: TabId,
    },
}

/// Payload the service pushes over a usage channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ChannelPayload {
    DataUsageUpdate { usage: u64 },
}

/// Successful answer to a [`RuntimeMessage`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Reply {
    SettingUpdated {
        key: SettingKey,
        previous: SettingValue,
        current: SettingValue,
    },
    Settings {
        settings: FeatureSettings,
    },
    Usage {
        #[serde(rename = "tabId")]
        tab_id: TabId,
        usage: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_runtime_message_parses_update_setting() {
        let msg: RuntimeMessage = serde_json::from_value(json!({
            "action": "updateSetting",
            "key": "audioOnlyMode",
            "value": true
        }))
        .unwrap();
        assert_eq!(
            msg,
            RuntimeMessage::UpdateSetting {
                key: "audioOnlyMode".to_string(),
                value: json!(true)
            }
        );
    }

    #[test]
    fn test_runtime_message_parses_toggle_and_queries() {
        let toggle: RuntimeMessage =
            serde_json::from_value(json!({ "action": "toggleRedirect", "enabled": false })).unwrap();
        assert_eq!(toggle, RuntimeMessage::ToggleRedirect { enabled: false });

        let get: RuntimeMessage = serde_json::from_value(json!({ "action": "getSettings" })).unwrap();
        assert_eq!(get, RuntimeMessage::GetSettings);

        let usage: RuntimeMessage =
            serde_json::from_value(json!({ "action": "getUsage", "tabId": 7 })).unwrap();
        assert_eq!(usage, RuntimeMessage::GetUsage { tab_id: 7 });
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let result = serde_json::from_value::<RuntimeMessage>(json!({ "action": "selfDestruct" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_port_register_wire_shape() {
        let msg: PortMessage =
            serde_json::from_value(json!({ "action": "register", "tabId": 42 })).unwrap();
        assert_eq!(msg, PortMessage::Register { tab_id: 42 });
    }

    #[test]
    fn test_channel_payload_wire_shape() {
        let json = serde_json::to_value(ChannelPayload::DataUsageUpdate { usage: 2000 }).unwrap();
        assert_eq!(json, json!({ "action": "dataUsageUpdate", "usage": 2000 }));
    }

    #[test]
    fn test_reply_wire_shape() {
        let json = serde_json::to_value(Reply::SettingUpdated {
            key: SettingKey::AudioOnlyMode,
            previous: SettingValue::Flag(false),
            current: SettingValue::Flag(true),
        })
        .unwrap();
        assert_eq!(
            json,
            json!({
                "type": "settingUpdated",
                "key": "audioOnlyMode",
                "previous": false,
                "current": true
            })
        );
    }

    #[test]
    fn test_header_value_may_be_absent() {
        let header: HttpHeader = serde_json::from_value(json!({ "name": "Content-Length" })).unwrap();
        assert_eq!(header.value, None);
    }
}
