//! Shared service state handed to every handler.

use std::sync::Arc;

use dashmap::DashMap;

use crate::core::{RuleSynchronizer, SettingsStore, SubscriberRegistry, TabId, TabUsageLedger};
use crate::host::{Channel, ChannelId, KeyValueStore, RuleEngine};

/// An open usage channel and the tab it registered for, if it has.
pub struct PortSession {
    pub channel: Arc<dyn Channel>,
    pub tab_id: Option<TabId>,
}

/// Shared service state owned by the router.
pub struct ServiceState {
    pub settings: SettingsStore,
    pub rules: RuleSynchronizer,
    pub usage: TabUsageLedger,
    pub subscribers: SubscriberRegistry,
    /// Open `data_usage_port` channels, so a disconnect can be traced back to its tab.
    pub ports: DashMap<ChannelId, PortSession>,
}

impl ServiceState {
    pub fn new(storage: Arc<dyn KeyValueStore>, engine: Arc<dyn RuleEngine>) -> Self {
        Self {
            settings: SettingsStore::new(storage),
            rules: RuleSynchronizer::new(engine),
            usage: TabUsageLedger::new(),
            subscribers: SubscriberRegistry::new(),
            ports: DashMap::new(),
        }
    }
}
