//! Core state: settings, blocking rules, per-tab usage and live subscribers.
//!
//! - [`SettingsStore`]: in-process settings record, persisted on update
//! - [`RuleSynchronizer`]: keeps host blocking rules in step with `audioOnlyMode`
//! - [`TabUsageLedger`]: per-tab byte counters
//! - [`SubscriberRegistry`]: one live-update channel per tab

pub mod rules;
pub mod settings;
pub mod subscribers;
pub mod usage;

pub use rules::{ResourceKind, RuleBatch, RulePredicate, RuleSynchronizer};
pub use settings::{DisplayMode, FeatureSettings, SettingKey, SettingValue, SettingsStore};
pub use subscribers::SubscriberRegistry;
pub use usage::{TabId, TabUsageLedger};
