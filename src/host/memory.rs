//! In-memory host capabilities.
//!
//! Used by tests and by embedders that have no browser behind them. The rule engine
//! validates a batch completely before committing it, like the real engine does.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::config;
use crate::core::rules::{ResourceKind, RuleBatch, RuleId, RulePredicate};
use crate::error::AppError;

use super::messages::ChannelPayload;
use super::{Channel, ChannelId, KeyValueStore, RuleEngine, StorageChange};

/// Key-value store held in a `HashMap`.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
    changes: broadcast::Sender<StorageChange>,
    unavailable: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(config::STORAGE_CHANGE_CAPACITY);
        Self {
            entries: Mutex::new(HashMap::new()),
            changes,
            unavailable: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    /// Put a value in place without notifying or counting a write.
    pub fn seed(&self, key: &str, value: Value) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
    }

    pub fn peek(&self, key: &str) -> Option<Value> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Simulate an unreachable persistence layer.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    fn check_available(&self) -> Result<(), AppError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(AppError::StorageUnavailable(
                "in-memory storage marked unavailable".into(),
            ));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, AppError> {
        self.check_available()?;
        Ok(self.peek(key))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), AppError> {
        self.check_available()?;
        let old_value = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);

        // No receivers is fine: nobody else holds the store.
        let _ = self.changes.send(StorageChange {
            key: key.to_string(),
            old_value,
            new_value: Some(value),
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

/// Rule engine keeping the active set in a `BTreeMap` ordered by id.
pub struct MemoryRuleEngine {
    active: Mutex<BTreeMap<RuleId, (RulePredicate, Regex)>>,
    batches: AtomicUsize,
    rejecting: AtomicBool,
}

impl MemoryRuleEngine {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(BTreeMap::new()),
            batches: AtomicUsize::new(0),
            rejecting: AtomicBool::new(false),
        }
    }

    /// Reject every following batch, as a host does for a malformed predicate.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::Relaxed);
    }

    /// Number of batches committed.
    pub fn batch_count(&self) -> usize {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn active_rule_ids(&self) -> Vec<RuleId> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Whether any active rule blocks a request for `url` of kind `kind`.
    pub fn is_blocked(&self, url: &str, kind: ResourceKind) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|(rule, pattern)| {
                rule.condition.resource_types.contains(&kind) && pattern.is_match(url)
            })
    }
}

impl Default for MemoryRuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuleEngine for MemoryRuleEngine {
    async fn install_rules(&self, batch: &RuleBatch) -> Result<(), AppError> {
        if self.rejecting.load(Ordering::Relaxed) {
            return Err(AppError::RuleInstallFailed(
                "rule engine rejected the batch".into(),
            ));
        }

        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = active.clone();
        for id in &batch.remove_rule_ids {
            next.remove(id);
        }
        for rule in &batch.add_rules {
            if rule.id == 0 {
                return Err(AppError::RuleInstallFailed("rule id must be positive".into()));
            }
            if next.contains_key(&rule.id) {
                return Err(AppError::RuleInstallFailed(format!(
                    "rule id {} is already installed",
                    rule.id
                )));
            }
            let pattern = Regex::new(&rule.condition.regex_filter).map_err(|e| {
                AppError::RuleInstallFailed(format!("rule {} has an invalid regex: {e}", rule.id))
            })?;
            next.insert(rule.id, (rule.clone(), pattern));
        }

        *active = next;
        self.batches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Channel that records everything sent over it.
pub struct MemoryChannel {
    id: ChannelId,
    name: String,
    sent: Mutex<Vec<ChannelPayload>>,
    connected: AtomicBool,
}

impl MemoryChannel {
    pub fn new(id: ChannelId) -> Self {
        Self::named(id, config::DATA_USAGE_PORT_NAME)
    }

    pub fn named(id: ChannelId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        }
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    pub fn sent(&self) -> Vec<ChannelPayload> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Channel for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, payload: &ChannelPayload) -> Result<(), AppError> {
        if !self.is_connected() {
            return Err(AppError::ChannelClosed(format!("channel {} is closed", self.id)));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(payload.clone());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rules::{RuleAction, RuleCondition};
    use serde_json::json;

    fn rule(id: RuleId, regex: &str) -> RulePredicate {
        RulePredicate {
            id,
            priority: 1,
            action: RuleAction::Block,
            condition: RuleCondition {
                regex_filter: regex.to_string(),
                resource_types: vec![ResourceKind::Script],
            },
        }
    }

    #[tokio::test]
    async fn test_store_set_notifies_subscribers() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();
        store.set("k", json!(1)).await.unwrap();
        store.set("k", json!(2)).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.old_value, None);
        assert_eq!(first.new_value, Some(json!(1)));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.old_value, Some(json!(1)));
        assert_eq!(second.new_value, Some(json!(2)));
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_reads_and_writes() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert_eq!(store.get("k").await.unwrap_err().kind(), "StorageUnavailable");
        assert_eq!(store.set("k", json!(1)).await.unwrap_err().kind(), "StorageUnavailable");
    }

    #[tokio::test]
    async fn test_batch_with_invalid_regex_is_not_partially_applied() {
        let engine = MemoryRuleEngine::new();
        let batch = RuleBatch {
            add_rules: vec![rule(10, "^https://ok\\.example/"), rule(11, "([unclosed")],
            remove_rule_ids: vec![],
        };
        let err = engine.install_rules(&batch).await.unwrap_err();
        assert_eq!(err.kind(), "RuleInstallFailed");
        assert!(engine.active_rule_ids().is_empty());
        assert_eq!(engine.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_id_without_removal_is_rejected() {
        let engine = MemoryRuleEngine::new();
        let add = RuleBatch {
            add_rules: vec![rule(3, "x")],
            remove_rule_ids: vec![],
        };
        engine.install_rules(&add).await.unwrap();
        assert!(engine.install_rules(&add).await.is_err());

        let replace = RuleBatch {
            add_rules: vec![rule(3, "y")],
            remove_rule_ids: vec![3],
        };
        engine.install_rules(&replace).await.unwrap();
        assert_eq!(engine.active_rule_ids(), vec![3]);
    }

    #[test]
    fn test_memory_channel_refuses_sends_after_disconnect() {
        let channel = MemoryChannel::new(1);
        let payload = ChannelPayload::DataUsageUpdate { usage: 1 };
        channel.send(&payload).unwrap();
        channel.disconnect();
        assert_eq!(channel.send(&payload).unwrap_err().kind(), "ChannelClosed");
        assert_eq!(channel.sent().len(), 1);
    }
}
