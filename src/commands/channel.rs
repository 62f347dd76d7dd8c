//! Usage channel handshake and teardown.

use std::sync::Arc;

use crate::core::TabId;
use crate::host::messages::{ChannelPayload, PortMessage};
use crate::host::{Channel, ChannelId};

use super::logic;
use super::state::{PortSession, ServiceState};

/// Track a newly opened channel if it is a usage port. Others are ignored.
pub fn channel_opened(state: &ServiceState, channel: Arc<dyn Channel>) {
    if !logic::is_usage_port(channel.name()) {
        tracing::debug!("Ignoring channel {} named {:?}", channel.id(), channel.name());
        return;
    }
    state.ports.insert(
        channel.id(),
        PortSession {
            channel,
            tab_id: None,
        },
    );
}

pub fn channel_message(state: &ServiceState, channel_id: ChannelId, message: PortMessage) {
    match message {
        PortMessage::Register { tab_id } => register(state, channel_id, tab_id),
    }
}

/// Handshake: subscribe the channel to `tab_id` and push the current total right away.
fn register(state: &ServiceState, channel_id: ChannelId, tab_id: TabId) {
    let (channel, previous_tab) = {
        let Some(mut session) = state.ports.get_mut(&channel_id) else {
            tracing::debug!("Register from untracked channel {channel_id}");
            return;
        };
        let previous_tab = session.tab_id.replace(tab_id);
        (Arc::clone(&session.channel), previous_tab)
    };

    if let Some(old_tab) = previous_tab.filter(|t| *t != tab_id) {
        state.subscribers.unregister(old_tab, channel_id);
    }
    if let Some(superseded) = state.subscribers.register(tab_id, channel) {
        tracing::debug!("Channel {channel_id} supersedes {superseded} for tab {tab_id}");
    }

    let usage = state.usage.current(tab_id);
    state
        .subscribers
        .notify(tab_id, &ChannelPayload::DataUsageUpdate { usage });
}

pub fn channel_disconnected(state: &ServiceState, channel_id: ChannelId) {
    let Some((_, session)) = state.ports.remove(&channel_id) else {
        return;
    };
    if let Some(tab_id) = session.tab_id {
        if state.subscribers.unregister(tab_id, channel_id) {
            tracing::debug!("Channel {channel_id} unsubscribed from tab {tab_id}");
        }
    }
}
