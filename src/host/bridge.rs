//! JSON-lines host bridge.
//!
//! Runs the service as a standalone process next to a browser: every inbound line on the
//! input stream is one host notification or acknowledgement, every outbound line one
//! instruction or reply. Frames are `type`-tagged camelCase JSON objects. Unparseable lines
//! are logged and skipped.
//!
//! Rule installs and storage reads and writes carry a `requestId` and wait for the host's
//! matching `rulesInstalled` or `storageResult` frame. The host's storage is authoritative;
//! every `storageChanged` it reports is broadcast to subscribers and mirrored into the
//! local SQLite database when one is open.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config;
use crate::core::rules::{ResourceKind, RuleBatch};
use crate::core::usage::TabId;
use crate::db::Database;
use crate::error::AppError;

use super::messages::{ChannelPayload, HttpHeader, PortMessage, Reply, RuntimeMessage};
use super::{Channel, ChannelId, HostEvent, KeyValueStore, RuleEngine, StorageChange};

/// One line read from the host.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundFrame {
    #[serde(rename_all = "camelCase")]
    NavigationStarted {
        tab_id: TabId,
        #[serde(default)]
        url: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ResponseReceived {
        tab_id: TabId,
        #[serde(default)]
        url: String,
        #[serde(default)]
        resource_type: Option<String>,
        #[serde(default)]
        headers: Vec<HttpHeader>,
    },
    #[serde(rename_all = "camelCase")]
    TabClosed { tab_id: TabId },
    /// A one-shot message. Without a `requestId` no reply is written.
    #[serde(rename_all = "camelCase")]
    Message {
        #[serde(default)]
        request_id: Option<u64>,
        message: RuntimeMessage,
    },
    #[serde(rename_all = "camelCase")]
    ChannelOpened { channel_id: ChannelId, name: String },
    #[serde(rename_all = "camelCase")]
    ChannelMessage {
        channel_id: ChannelId,
        message: PortMessage,
    },
    #[serde(rename_all = "camelCase")]
    ChannelDisconnected { channel_id: ChannelId },
    /// A write to the host's storage, including writes this service requested.
    #[serde(rename_all = "camelCase")]
    StorageChanged {
        key: String,
        #[serde(default)]
        old_value: Option<Value>,
        #[serde(default)]
        new_value: Option<Value>,
    },
    /// Outcome of an `installRules` request. An `error` means the whole batch was rejected.
    #[serde(rename_all = "camelCase")]
    RulesInstalled {
        request_id: u64,
        #[serde(default)]
        error: Option<String>,
    },
    /// Outcome of a `storageGet` or `storageSet` request.
    #[serde(rename_all = "camelCase")]
    StorageResult {
        request_id: u64,
        #[serde(default)]
        value: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
}

/// One line written to the host.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundFrame {
    #[serde(rename_all = "camelCase")]
    ChannelPost {
        channel_id: ChannelId,
        payload: ChannelPayload,
    },
    #[serde(rename_all = "camelCase")]
    InstallRules {
        request_id: u64,
        #[serde(flatten)]
        batch: RuleBatch,
    },
    #[serde(rename_all = "camelCase")]
    StorageGet { request_id: u64, key: String },
    #[serde(rename_all = "camelCase")]
    StorageSet {
        request_id: u64,
        key: String,
        value: Value,
    },
    #[serde(rename_all = "camelCase")]
    Reply {
        request_id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Reply>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<AppError>,
    },
}

impl OutboundFrame {
    fn reply(request_id: u64, outcome: Result<Reply, AppError>) -> Self {
        match outcome {
            Ok(reply) => OutboundFrame::Reply {
                request_id,
                result: Some(reply),
                error: None,
            },
            Err(e) => OutboundFrame::Reply {
                request_id,
                result: None,
                error: Some(e),
            },
        }
    }
}

/// Handle for queueing outbound frames. Cheap to clone.
#[derive(Clone)]
pub struct BridgeWriter {
    tx: mpsc::UnboundedSender<OutboundFrame>,
}

impl BridgeWriter {
    pub fn send(&self, frame: OutboundFrame) -> Result<(), AppError> {
        self.tx
            .send(frame)
            .map_err(|_| AppError::ChannelClosed("bridge output is closed".into()))
    }
}

/// Spawn the task serializing outbound frames to `output`, one per line.
///
/// The task finishes once every [`BridgeWriter`] clone has been dropped.
pub fn spawn_writer<W>(mut output: W) -> (BridgeWriter, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let handle = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let mut line = serde_json::to_string(&frame)?;
            line.push('\n');
            output.write_all(line.as_bytes()).await?;
            output.flush().await?;
        }
        Ok(())
    });
    (BridgeWriter { tx }, handle)
}

/// The host's answer to a request: a value on success, its error message otherwise.
type HostAck = Result<Option<Value>, String>;

/// Requests written to the host that are still waiting for an acknowledgement.
struct PendingRequests {
    next_id: AtomicU64,
    waiting: DashMap<u64, oneshot::Sender<HostAck>>,
    closed: AtomicBool,
}

impl PendingRequests {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            waiting: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn register(&self) -> Result<(u64, oneshot::Receiver<HostAck>), AppError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(id, tx);
        // Checked after inserting so a concurrent close cannot strand the entry.
        if self.closed.load(Ordering::Acquire) {
            self.waiting.remove(&id);
            return Err(AppError::ChannelClosed("bridge input is closed".into()));
        }
        Ok((id, rx))
    }

    fn forget(&self, id: u64) {
        self.waiting.remove(&id);
    }

    fn resolve(&self, id: u64, ack: HostAck) {
        match self.waiting.remove(&id) {
            Some((_, tx)) => {
                if tx.send(ack).is_err() {
                    tracing::debug!("Requester for {id} stopped waiting");
                }
            }
            None => tracing::debug!("Ignoring acknowledgement for unknown request {id}"),
        }
    }

    /// Fail every outstanding request and refuse new ones.
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let abandoned = self.waiting.len();
        self.waiting.clear();
        if abandoned > 0 {
            tracing::warn!("Bridge closed with {abandoned} requests unanswered");
        }
    }
}

/// Shared state of one bridge connection. Cheap to clone.
///
/// Hands out the [`RuleEngine`] and [`KeyValueStore`] that talk to the host, and is given
/// to [`run_reader`] so acknowledgements and storage changes reach them.
#[derive(Clone)]
pub struct BridgeHost {
    writer: BridgeWriter,
    pending: Arc<PendingRequests>,
    changes: broadcast::Sender<StorageChange>,
    mirror: Option<Arc<Database>>,
}

impl BridgeHost {
    /// `mirror` receives a copy of every storage change the host reports.
    pub fn new(writer: BridgeWriter, mirror: Option<Arc<Database>>) -> Self {
        let (changes, _) = broadcast::channel(config::STORAGE_CHANGE_CAPACITY);
        Self {
            writer,
            pending: Arc::new(PendingRequests::new()),
            changes,
            mirror,
        }
    }

    pub fn rule_engine(&self) -> BridgeRuleEngine {
        BridgeRuleEngine { host: self.clone() }
    }

    pub fn store(&self) -> BridgeStore {
        BridgeStore { host: self.clone() }
    }

    /// Number of requests still waiting for the host.
    pub fn pending_requests(&self) -> usize {
        self.pending.waiting.len()
    }

    /// Write the frame built for a fresh request id and wait for the host's answer.
    async fn request<F>(&self, build: F) -> Result<HostAck, AppError>
    where
        F: FnOnce(u64) -> OutboundFrame + Send,
    {
        let (id, rx) = self.pending.register()?;
        if let Err(e) = self.writer.send(build(id)) {
            self.pending.forget(id);
            return Err(e);
        }
        rx.await
            .map_err(|_| AppError::ChannelClosed(format!("host went away before answering request {id}")))
    }

    fn publish_change(&self, change: StorageChange) {
        if let Some(mirror) = &self.mirror {
            let mirrored = match &change.new_value {
                Some(value) => mirror.set_value(&change.key, value).map(|_| ()),
                None => mirror.remove_value(&change.key),
            };
            if let Err(e) = mirrored {
                tracing::warn!("Local mirror not updated for {}: {e:#}", change.key);
            }
        }
        if self.changes.send(change).is_err() {
            tracing::debug!("No storage subscribers");
        }
    }
}

/// Host channel whose sends become `channelPost` frames.
pub struct BridgeChannel {
    id: ChannelId,
    name: String,
    writer: BridgeWriter,
    connected: AtomicBool,
}

impl BridgeChannel {
    pub fn new(id: ChannelId, name: String, writer: BridgeWriter) -> Self {
        Self {
            id,
            name,
            writer,
            connected: AtomicBool::new(true),
        }
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }
}

impl Channel for BridgeChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, payload: &ChannelPayload) -> Result<(), AppError> {
        if !self.is_connected() {
            return Err(AppError::ChannelClosed(format!("channel {} disconnected", self.id)));
        }
        self.writer.send(OutboundFrame::ChannelPost {
            channel_id: self.id,
            payload: payload.clone(),
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

/// Rule engine that submits each batch as an `installRules` request.
///
/// Resolves once the host reports the batch applied. A host error, or a bridge that closes
/// first, is a [`AppError::RuleInstallFailed`].
pub struct BridgeRuleEngine {
    host: BridgeHost,
}

#[async_trait]
impl RuleEngine for BridgeRuleEngine {
    async fn install_rules(&self, batch: &RuleBatch) -> Result<(), AppError> {
        let ack = self
            .host
            .request(|request_id| OutboundFrame::InstallRules {
                request_id,
                batch: batch.clone(),
            })
            .await
            .map_err(|e| AppError::RuleInstallFailed(e.to_string()))?;
        ack.map(|_| ()).map_err(AppError::RuleInstallFailed)
    }
}

/// Key-value store backed by the host's shared storage.
///
/// Writes are not broadcast locally: the host reports them back as `storageChanged` like
/// any other context's write.
pub struct BridgeStore {
    host: BridgeHost,
}

#[async_trait]
impl KeyValueStore for BridgeStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, AppError> {
        self.host
            .request(|request_id| OutboundFrame::StorageGet {
                request_id,
                key: key.to_string(),
            })
            .await
            .map_err(|e| AppError::StorageUnavailable(e.to_string()))?
            .map_err(AppError::StorageUnavailable)
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), AppError> {
        self.host
            .request(|request_id| OutboundFrame::StorageSet {
                request_id,
                key: key.to_string(),
                value,
            })
            .await
            .map_err(|e| AppError::StorageUnavailable(e.to_string()))?
            .map(|_| ())
            .map_err(AppError::StorageUnavailable)
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.host.changes.subscribe()
    }
}

/// Host resource type names outside [`ResourceKind`] are reported as unknown.
fn parse_resource_kind(name: &str) -> Option<ResourceKind> {
    serde_json::from_value(Value::String(name.to_string())).ok()
}

/// Read frames from `input` until EOF or until the event queue's consumer goes away.
///
/// Acknowledgements are resolved as they are read. Events pass through an unbounded staging
/// queue so a full event queue never holds back the acknowledgement its consumer awaits.
pub async fn run_reader<R>(input: R, events: mpsc::Sender<HostEvent>, host: BridgeHost) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let (staged, mut staged_rx) = mpsc::unbounded_channel::<HostEvent>();
    let pump = tokio::spawn(async move {
        while let Some(event) = staged_rx.recv().await {
            if events.send(event).await.is_err() {
                break;
            }
        }
    });

    let outcome = read_frames(input, &staged, &host).await;

    host.pending.close();
    drop(staged);
    if let Err(e) = pump.await {
        tracing::warn!("Event pump task aborted: {e}");
    }
    outcome
}

async fn read_frames<R>(
    input: R,
    staged: &mpsc::UnboundedSender<HostEvent>,
    host: &BridgeHost,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut channels: HashMap<ChannelId, Arc<BridgeChannel>> = HashMap::new();
    let mut frames = 0u64;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let frame: InboundFrame = match serde_json::from_str(line) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Skipping malformed bridge frame: {e}");
                continue;
            }
        };
        frames += 1;

        let event = match frame {
            InboundFrame::NavigationStarted { tab_id, url } => {
                HostEvent::NavigationStarted { tab_id, url }
            }
            InboundFrame::ResponseReceived {
                tab_id,
                url,
                resource_type,
                headers,
            } => HostEvent::ResponseReceived {
                tab_id,
                url,
                resource_kind: resource_type.as_deref().and_then(parse_resource_kind),
                headers,
            },
            InboundFrame::TabClosed { tab_id } => HostEvent::TabClosed { tab_id },
            InboundFrame::Message {
                request_id,
                message,
            } => HostEvent::Message {
                message,
                reply: request_id.map(|id| spawn_reply(id, host.writer.clone())),
            },
            InboundFrame::ChannelOpened { channel_id, name } => {
                let channel = Arc::new(BridgeChannel::new(channel_id, name, host.writer.clone()));
                channels.insert(channel_id, Arc::clone(&channel));
                HostEvent::ChannelOpened { channel }
            }
            InboundFrame::ChannelMessage {
                channel_id,
                message,
            } => HostEvent::ChannelMessage {
                channel_id,
                message,
            },
            InboundFrame::ChannelDisconnected { channel_id } => {
                if let Some(channel) = channels.remove(&channel_id) {
                    channel.mark_disconnected();
                }
                HostEvent::ChannelDisconnected { channel_id }
            }
            InboundFrame::StorageChanged {
                key,
                old_value,
                new_value,
            } => {
                host.publish_change(StorageChange {
                    key,
                    old_value,
                    new_value,
                });
                continue;
            }
            InboundFrame::RulesInstalled { request_id, error } => {
                host.pending.resolve(request_id, error.map_or(Ok(None), Err));
                continue;
            }
            InboundFrame::StorageResult {
                request_id,
                value,
                error,
            } => {
                host.pending
                    .resolve(request_id, error.map_or(Ok(value), Err));
                continue;
            }
        };

        if staged.send(event).is_err() {
            tracing::debug!("Event queue closed; bridge reader stopping");
            break;
        }
    }

    tracing::info!("Bridge input closed after {frames} frames");
    Ok(())
}

/// Create a reply slot whose answer is written back as a `reply` frame.
fn spawn_reply(request_id: u64, writer: BridgeWriter) -> oneshot::Sender<Result<Reply, AppError>> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        match rx.await {
            Ok(outcome) => {
                if let Err(e) = writer.send(OutboundFrame::reply(request_id, outcome)) {
                    tracing::warn!("Dropping reply to request {request_id}: {e}");
                }
            }
            Err(_) => tracing::debug!("Request {request_id} finished without a reply"),
        }
    });
    tx
}
