//! Live-update subscribers keyed by tab.
//!
//! At most one channel per tab. The newest registration wins, and a disconnect only
//! removes the entry if it still points at the disconnecting channel.

use std::sync::Arc;

use dashmap::DashMap;

use crate::core::usage::TabId;
use crate::host::messages::ChannelPayload;
use crate::host::{Channel, ChannelId};

pub struct SubscriberRegistry {
    channels: DashMap<TabId, Arc<dyn Channel>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Make `channel` the subscriber for `tab_id`. Returns the id of a superseded channel.
    /// The superseded channel is left open; its own disconnect cleans up after it.
    pub fn register(&self, tab_id: TabId, channel: Arc<dyn Channel>) -> Option<ChannelId> {
        let new_id = channel.id();
        self.channels
            .insert(tab_id, channel)
            .map(|old| old.id())
            .filter(|old_id| *old_id != new_id)
    }

    /// Remove the subscriber for `tab_id` only if it is still `channel_id`.
    pub fn unregister(&self, tab_id: TabId, channel_id: ChannelId) -> bool {
        self.channels
            .remove_if(&tab_id, |_, channel| channel.id() == channel_id)
            .is_some()
    }

    /// Remove whatever subscriber `tab_id` has.
    pub fn remove_tab(&self, tab_id: TabId) -> bool {
        self.channels.remove(&tab_id).is_some()
    }

    pub fn subscriber_for(&self, tab_id: TabId) -> Option<ChannelId> {
        self.channels.get(&tab_id).map(|c| c.id())
    }

    /// Deliver `payload` to the tab's subscriber if one is live. Never fails the caller.
    pub fn notify(&self, tab_id: TabId, payload: &ChannelPayload) -> bool {
        // Clone out so the shard lock is not held across the send.
        let Some(channel) = self.channels.get(&tab_id).map(|c| Arc::clone(c.value())) else {
            return false;
        };

        if !channel.is_connected() {
            tracing::debug!("Subscriber {} for tab {tab_id} is no longer live", channel.id());
            return false;
        }

        match channel.send(payload) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to notify tab {tab_id} on channel {}: {e}", channel.id());
                false
            }
        }
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}
