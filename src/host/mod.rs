//! Host capabilities consumed by the service.
//!
//! The browser runtime supplies persistence, a declarative rule engine, long-lived
//! channels and lifecycle notifications. Each is a trait here so the service can run
//! against:
//! - the JSON-lines bridge (`bridge`) in the binary, mirroring storage into SQLite (`crate::db`)
//! - in-memory doubles (`memory`) in tests

pub mod bridge;
pub mod memory;
pub mod messages;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};

use crate::core::rules::{ResourceKind, RuleBatch};
use crate::core::usage::TabId;
use crate::error::AppError;

use messages::{ChannelPayload, HttpHeader, PortMessage, Reply, RuntimeMessage};

/// Host-assigned identity of one channel instance.
pub type ChannelId = u64;

/// A change to one storage key, delivered to every context holding the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageChange {
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

/// Key-value persistence with change notifications.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, AppError>;

    /// Store `value` and notify every subscriber, including the writer.
    async fn set(&self, key: &str, value: Value) -> Result<(), AppError>;

    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

/// Declarative network rule engine. A batch is applied entirely or not at all.
#[async_trait]
pub trait RuleEngine: Send + Sync {
    async fn install_rules(&self, batch: &RuleBatch) -> Result<(), AppError>;
}

/// One end of a long-lived bidirectional channel to a UI context.
pub trait Channel: Send + Sync {
    fn id(&self) -> ChannelId;
    fn name(&self) -> &str;
    fn send(&self, payload: &ChannelPayload) -> Result<(), AppError>;
    fn is_connected(&self) -> bool;
}

/// Reply slot for a one-shot message.
pub type ReplySender = oneshot::Sender<Result<Reply, AppError>>;

/// Lifecycle notifications delivered to the router.
pub enum HostEvent {
    NavigationStarted {
        tab_id: TabId,
        url: Option<String>,
    },
    ResponseReceived {
        tab_id: TabId,
        url: String,
        resource_kind: Option<ResourceKind>,
        headers: Vec<HttpHeader>,
    },
    TabClosed {
        tab_id: TabId,
    },
    Message {
        message: RuntimeMessage,
        reply: Option<ReplySender>,
    },
    ChannelOpened {
        channel: Arc<dyn Channel>,
    },
    ChannelMessage {
        channel_id: ChannelId,
        message: PortMessage,
    },
    ChannelDisconnected {
        channel_id: ChannelId,
    },
    StorageChanged(StorageChange),
    /// Change notifications were dropped before reaching the router.
    StorageLagged {
        skipped: u64,
    },
}

impl HostEvent {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            HostEvent::NavigationStarted { .. } => "navigation-started",
            HostEvent::ResponseReceived { .. } => "response-received",
            HostEvent::TabClosed { .. } => "tab-closed",
            HostEvent::Message { .. } => "message",
            HostEvent::ChannelOpened { .. } => "channel-opened",
            HostEvent::ChannelMessage { .. } => "channel-message",
            HostEvent::ChannelDisconnected { .. } => "channel-disconnected",
            HostEvent::StorageChanged(_) => "storage-changed",
            HostEvent::StorageLagged { .. } => "storage-lagged",
        }
    }
}
