//! Background service lifecycle management.
//!
//! `BackgroundServices` runs the router's startup sequence, forwards storage change
//! notifications into the event queue and drives the single dispatch loop until every
//! event producer has gone away.

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::host::{HostEvent, StorageChange};
use crate::router::EventRouter;

/// Owns the tasks spawned around the dispatch loop.
///
/// Started in dependency order:
/// 1. Router start (settings load, then rule reconcile)
/// 2. Storage forwarder (change notifications become `StorageChanged` events)
/// 3. Dispatch loop (one event at a time, until the queue closes)
pub struct BackgroundServices;

impl BackgroundServices {
    /// Run until all strong senders of `events_tx` are dropped.
    ///
    /// `storage_changes` must be subscribed before this is called so the startup write's
    /// notification is not missed.
    pub async fn run(
        router: &EventRouter,
        storage_changes: broadcast::Receiver<StorageChange>,
        events_tx: mpsc::Sender<HostEvent>,
        mut events_rx: mpsc::Receiver<HostEvent>,
    ) {
        // 1. Settings must be loaded before any event is handled.
        router.start().await;

        // 2. The forwarder holds only a weak sender so it never keeps the loop alive.
        let forwarder = Self::start_storage_forwarder(storage_changes, events_tx.downgrade());
        drop(events_tx);

        // 3. Dispatch loop.
        let mut handled = 0u64;
        while let Some(event) = events_rx.recv().await {
            router.dispatch(event).await;
            handled += 1;
        }

        forwarder.abort();
        tracing::info!("Event loop stopped after {handled} events");
    }

    fn start_storage_forwarder(
        mut changes: broadcast::Receiver<StorageChange>,
        events: mpsc::WeakSender<HostEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        let Some(events) = events.upgrade() else {
                            break;
                        };
                        if events.send(HostEvent::StorageChanged(change)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Storage forwarder lagged; {skipped} change notifications lost");
                        let Some(events) = events.upgrade() else {
                            break;
                        };
                        if events.send(HostEvent::StorageLagged { skipped }).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::debug!("Storage forwarder stopped");
        })
    }
}
