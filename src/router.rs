//! Routes host lifecycle events to the handlers in [`crate::commands`].
//!
//! The router owns the service state and is driven by a single consumer loop, so each
//! event is handled to completion before the next one starts.

use std::sync::Arc;

use crate::commands::{self, logic, ServiceState};
use crate::error::AppError;
use crate::host::messages::{Reply, RuntimeMessage};
use crate::host::{HostEvent, KeyValueStore, RuleEngine};

pub struct EventRouter {
    state: ServiceState,
}

impl EventRouter {
    pub fn new(storage: Arc<dyn KeyValueStore>, engine: Arc<dyn RuleEngine>) -> Self {
        Self {
            state: ServiceState::new(storage, engine),
        }
    }

    /// Service start: load settings, then reconcile rules with them.
    pub async fn start(&self) {
        commands::settings::initialize(&self.state).await;
    }

    pub async fn dispatch(&self, event: HostEvent) {
        tracing::trace!("Dispatching {}", event.label());
        match event {
            HostEvent::NavigationStarted { tab_id, url } => {
                commands::usage::navigation_started(&self.state, tab_id, url.as_deref());
            }
            HostEvent::ResponseReceived {
                tab_id,
                url,
                resource_kind,
                headers,
            } => {
                commands::usage::response_received(&self.state, tab_id, &url, resource_kind, &headers);
            }
            HostEvent::TabClosed { tab_id } => commands::usage::tab_closed(&self.state, tab_id),
            HostEvent::Message { message, reply } => {
                let outcome = self.handle_message(message).await;
                match reply {
                    Some(reply) => {
                        if reply.send(outcome).is_err() {
                            tracing::debug!("Requester went away before the reply was ready");
                        }
                    }
                    None => {
                        if let Err(e) = outcome {
                            tracing::warn!("Message without reply slot failed: {e}");
                        }
                    }
                }
            }
            HostEvent::ChannelOpened { channel } => {
                commands::channel::channel_opened(&self.state, channel);
            }
            HostEvent::ChannelMessage {
                channel_id,
                message,
            } => commands::channel::channel_message(&self.state, channel_id, message),
            HostEvent::ChannelDisconnected { channel_id } => {
                commands::channel::channel_disconnected(&self.state, channel_id);
            }
            HostEvent::StorageChanged(change) => {
                commands::settings::apply_external_change(&self.state, &change).await;
            }
            HostEvent::StorageLagged { skipped } => {
                commands::settings::resync(&self.state, skipped).await;
            }
        }
    }

    /// Answer one runtime message.
    pub async fn handle_message(&self, message: RuntimeMessage) -> Result<Reply, AppError> {
        match message {
            RuntimeMessage::UpdateSetting { key, value } => {
                commands::settings::update_setting(&self.state, &key, &value).await
            }
            RuntimeMessage::ToggleRedirect { enabled } => {
                let (key, value) = logic::toggle_redirect_update(enabled);
                commands::settings::update_setting(&self.state, key.as_str(), &value).await
            }
            RuntimeMessage::GetSettings => Ok(commands::settings::get_settings(&self.state)),
            RuntimeMessage::GetUsage { tab_id } => Ok(commands::usage::get_usage(&self.state, tab_id)),
        }
    }

    pub fn state(&self) -> &ServiceState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::core::{DisplayMode, FeatureSettings, SettingKey, SettingValue};
    use crate::host::memory::{MemoryChannel, MemoryRuleEngine, MemoryStore};
    use crate::host::messages::{ChannelPayload, HttpHeader, PortMessage};
    use crate::host::{Channel, StorageChange};
    use serde_json::json;
    use tokio::sync::oneshot;

    struct Harness {
        storage: Arc<MemoryStore>,
        engine: Arc<MemoryRuleEngine>,
        router: EventRouter,
    }

    async fn started() -> Harness {
        let storage = Arc::new(MemoryStore::new());
        let engine = Arc::new(MemoryRuleEngine::new());
        let router = EventRouter::new(storage.clone(), engine.clone());
        router.start().await;
        Harness {
            storage,
            engine,
            router,
        }
    }

    fn response(tab_id: i64, bytes: &str) -> HostEvent {
        HostEvent::ResponseReceived {
            tab_id,
            url: "https://example.com/asset".to_string(),
            resource_kind: None,
            headers: vec![HttpHeader::new("Content-Length", bytes)],
        }
    }

    fn update(key: &str, value: serde_json::Value) -> RuntimeMessage {
        RuntimeMessage::UpdateSetting {
            key: key.to_string(),
            value,
        }
    }

    async fn open_and_register(router: &EventRouter, channel: &Arc<MemoryChannel>, tab_id: i64) {
        router
            .dispatch(HostEvent::ChannelOpened {
                channel: channel.clone(),
            })
            .await;
        router
            .dispatch(HostEvent::ChannelMessage {
                channel_id: channel.id(),
                message: PortMessage::Register { tab_id },
            })
            .await;
    }

    #[tokio::test]
    async fn test_start_with_empty_storage_persists_defaults_and_clears_rules() {
        let h = started().await;
        assert_eq!(
            h.storage.peek(config::SETTINGS_STORAGE_KEY),
            Some(json!({
                "linkRewrite": true,
                "audioOnlyMode": false,
                "audioOnlyDisplayMode": "text"
            }))
        );
        assert_eq!(h.engine.batch_count(), 1);
        assert!(h.engine.active_rule_ids().is_empty());
    }

    #[tokio::test]
    async fn test_start_with_audio_only_persisted_installs_rules() {
        let storage = Arc::new(MemoryStore::new());
        storage.seed(config::SETTINGS_STORAGE_KEY, json!({ "youtubeAudioOnly": true }));
        let engine = Arc::new(MemoryRuleEngine::new());
        let router = EventRouter::new(storage.clone(), engine.clone());
        router.start().await;

        assert!(router.state().settings.current().audio_only_mode);
        assert_eq!(engine.active_rule_ids(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_start_survives_unavailable_storage() {
        let storage = Arc::new(MemoryStore::new());
        storage.set_unavailable(true);
        let engine = Arc::new(MemoryRuleEngine::new());
        let router = EventRouter::new(storage, engine.clone());
        router.start().await;

        assert_eq!(router.state().settings.current(), FeatureSettings::default());
        assert_eq!(engine.batch_count(), 1);
    }

    #[tokio::test]
    async fn test_audio_only_update_reconciles_exactly_once() {
        let h = started().await;
        let after_start = h.engine.batch_count();

        let reply = h
            .router
            .handle_message(update("audioOnlyMode", json!(true)))
            .await
            .unwrap();
        assert_eq!(
            reply,
            Reply::SettingUpdated {
                key: SettingKey::AudioOnlyMode,
                previous: SettingValue::Flag(false),
                current: SettingValue::Flag(true),
            }
        );
        assert_eq!(h.engine.batch_count(), after_start + 1);
        assert_eq!(h.engine.active_rule_ids(), vec![1, 2]);

        h.router
            .handle_message(update("audioOnlyMode", json!(true)))
            .await
            .unwrap();
        assert_eq!(h.engine.batch_count(), after_start + 1);
    }

    #[tokio::test]
    async fn test_other_setting_updates_do_not_touch_rules() {
        let h = started().await;
        let after_start = h.engine.batch_count();
        h.router
            .handle_message(update("audioOnlyDisplayMode", json!("thumbnail")))
            .await
            .unwrap();
        h.router
            .handle_message(RuntimeMessage::ToggleRedirect { enabled: false })
            .await
            .unwrap();

        let current = h.router.state().settings.current();
        assert_eq!(current.audio_only_display_mode, DisplayMode::Thumbnail);
        assert!(!current.link_rewrite);
        assert_eq!(h.engine.batch_count(), after_start);
    }

    #[tokio::test]
    async fn test_invalid_update_is_rejected_without_side_effects() {
        let h = started().await;
        let writes = h.storage.write_count();

        let err = h
            .router
            .handle_message(update("audioOnlyMode", json!("yes")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidSettingValue");

        let err = h
            .router
            .handle_message(update("darkMode", json!(true)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidSettingValue");

        assert_eq!(h.storage.write_count(), writes);
        assert_eq!(h.router.state().settings.current(), FeatureSettings::default());
    }

    #[tokio::test]
    async fn test_rejected_rules_surface_to_requester() {
        let h = started().await;
        h.engine.set_rejecting(true);

        let err = h
            .router
            .handle_message(update("audioOnlyMode", json!(true)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "RuleInstallFailed");
        assert!(h.router.state().settings.current().audio_only_mode);
        assert!(h.engine.active_rule_ids().is_empty());
    }

    #[tokio::test]
    async fn test_tab_seven_usage_scenario() {
        let h = started().await;
        let channel = Arc::new(MemoryChannel::new(1));

        h.router
            .dispatch(HostEvent::NavigationStarted {
                tab_id: 7,
                url: Some("https://example.com".into()),
            })
            .await;
        open_and_register(&h.router, &channel, 7).await;
        h.router.dispatch(response(7, "1200")).await;
        h.router.dispatch(response(7, "800")).await;

        assert_eq!(h.router.state().usage.current(7), 2000);
        assert_eq!(
            channel.sent(),
            vec![
                ChannelPayload::DataUsageUpdate { usage: 0 },
                ChannelPayload::DataUsageUpdate { usage: 1200 },
                ChannelPayload::DataUsageUpdate { usage: 2000 },
            ]
        );

        h.router.dispatch(HostEvent::TabClosed { tab_id: 7 }).await;
        assert_eq!(h.router.state().usage.current(7), 0);
        assert_eq!(h.router.state().subscribers.subscriber_for(7), None);

        let reply = h
            .router
            .handle_message(RuntimeMessage::GetUsage { tab_id: 7 })
            .await
            .unwrap();
        assert_eq!(reply, Reply::Usage { tab_id: 7, usage: 0 });
    }

    #[tokio::test]
    async fn test_malformed_size_hint_is_dropped_silently() {
        let h = started().await;
        let channel = Arc::new(MemoryChannel::new(1));
        open_and_register(&h.router, &channel, 3).await;

        h.router.dispatch(response(3, "lots")).await;
        h.router
            .dispatch(HostEvent::ResponseReceived {
                tab_id: 3,
                url: "https://example.com/".into(),
                resource_kind: None,
                headers: vec![],
            })
            .await;
        h.router.dispatch(response(3, "10")).await;

        assert_eq!(h.router.state().usage.current(3), 10);
        assert_eq!(
            channel.sent(),
            vec![
                ChannelPayload::DataUsageUpdate { usage: 0 },
                ChannelPayload::DataUsageUpdate { usage: 10 },
            ]
        );
    }

    #[tokio::test]
    async fn test_register_pushes_current_total_immediately() {
        let h = started().await;
        h.router.dispatch(response(5, "4096")).await;

        let channel = Arc::new(MemoryChannel::new(11));
        open_and_register(&h.router, &channel, 5).await;
        assert_eq!(
            channel.sent(),
            vec![ChannelPayload::DataUsageUpdate { usage: 4096 }]
        );
    }

    #[tokio::test]
    async fn test_superseded_channel_disconnect_keeps_newer_subscriber() {
        let h = started().await;
        let old = Arc::new(MemoryChannel::new(1));
        let new = Arc::new(MemoryChannel::new(2));
        open_and_register(&h.router, &old, 7).await;
        open_and_register(&h.router, &new, 7).await;

        old.disconnect();
        h.router
            .dispatch(HostEvent::ChannelDisconnected { channel_id: 1 })
            .await;
        assert_eq!(h.router.state().subscribers.subscriber_for(7), Some(2));

        h.router.dispatch(response(7, "100")).await;
        assert_eq!(
            new.sent().last(),
            Some(&ChannelPayload::DataUsageUpdate { usage: 100 })
        );
    }

    #[tokio::test]
    async fn test_disconnect_of_current_subscriber_unregisters() {
        let h = started().await;
        let channel = Arc::new(MemoryChannel::new(4));
        open_and_register(&h.router, &channel, 9).await;

        h.router
            .dispatch(HostEvent::ChannelDisconnected { channel_id: 4 })
            .await;
        assert_eq!(h.router.state().subscribers.subscriber_for(9), None);
        assert!(h.router.state().ports.is_empty());
    }

    #[tokio::test]
    async fn test_channels_with_other_names_are_ignored() {
        let h = started().await;
        let channel = Arc::new(MemoryChannel::named(6, "settings_port"));
        open_and_register(&h.router, &channel, 2).await;

        assert_eq!(h.router.state().subscribers.subscriber_for(2), None);
        assert!(channel.sent().is_empty());
    }

    #[tokio::test]
    async fn test_external_change_triggers_reconcile() {
        let h = started().await;
        let after_start = h.engine.batch_count();
        let record = serde_json::to_value(FeatureSettings {
            audio_only_mode: true,
            ..FeatureSettings::default()
        })
        .unwrap();

        h.router
            .dispatch(HostEvent::StorageChanged(StorageChange {
                key: config::SETTINGS_STORAGE_KEY.to_string(),
                old_value: None,
                new_value: Some(record),
            }))
            .await;

        assert!(h.router.state().settings.current().audio_only_mode);
        assert_eq!(h.engine.batch_count(), after_start + 1);
        assert_eq!(h.engine.active_rule_ids(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_lost_notifications_reload_record_and_reconcile() {
        let h = started().await;
        let after_start = h.engine.batch_count();
        assert_eq!(h.router.state().settings.pending_echo_count(), 1);

        // Written elsewhere; the notification never arrives.
        h.storage.seed(
            config::SETTINGS_STORAGE_KEY,
            json!({ "linkRewrite": true, "audioOnlyMode": true, "audioOnlyDisplayMode": "text" }),
        );
        h.router
            .dispatch(HostEvent::StorageLagged { skipped: 3 })
            .await;

        assert!(h.router.state().settings.current().audio_only_mode);
        assert_eq!(h.router.state().settings.pending_echo_count(), 0);
        assert_eq!(h.engine.batch_count(), after_start + 1);
        assert_eq!(h.engine.active_rule_ids(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_message_reply_goes_to_reply_slot() {
        let h = started().await;
        let (tx, rx) = oneshot::channel();
        h.router
            .dispatch(HostEvent::Message {
                message: RuntimeMessage::GetSettings,
                reply: Some(tx),
            })
            .await;

        let reply = rx.await.unwrap().unwrap();
        assert_eq!(
            reply,
            Reply::Settings {
                settings: FeatureSettings::default()
            }
        );
    }
}
