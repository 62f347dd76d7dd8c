//! Feature settings record and the store that owns this context's authoritative copy.
//!
//! The record is persisted as one JSON object under [`config::SETTINGS_STORAGE_KEY`].
//! Updates mutate the in-memory copy first and then persist, so [`SettingsStore::current`]
//! always reflects the latest request even while its write is still in flight.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config;
use crate::error::AppError;
use crate::host::{KeyValueStore, StorageChange};

/// Known feature keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SettingKey {
    LinkRewrite,
    AudioOnlyMode,
    AudioOnlyDisplayMode,
}

impl SettingKey {
    pub const ALL: [SettingKey; 3] = [
        SettingKey::LinkRewrite,
        SettingKey::AudioOnlyMode,
        SettingKey::AudioOnlyDisplayMode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::LinkRewrite => "linkRewrite",
            SettingKey::AudioOnlyMode => "audioOnlyMode",
            SettingKey::AudioOnlyDisplayMode => "audioOnlyDisplayMode",
        }
    }

    /// Name used by records written before the keys were renamed.
    fn legacy_name(&self) -> &'static str {
        match self {
            SettingKey::LinkRewrite => "fxtwitter",
            SettingKey::AudioOnlyMode => "youtubeAudioOnly",
            SettingKey::AudioOnlyDisplayMode => "youtubeDisplayMode",
        }
    }

    /// Accepts canonical and legacy names.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|key| key.as_str() == name || key.legacy_name() == name)
    }
}

/// How the player area is rendered while audio-only mode is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    #[default]
    Text,
    Thumbnail,
}

/// A single setting value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Flag(bool),
    Display(DisplayMode),
}

/// The complete settings record. Every known key always has a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureSettings {
    pub link_rewrite: bool,
    pub audio_only_mode: bool,
    pub audio_only_display_mode: DisplayMode,
}

impl Default for FeatureSettings {
    fn default() -> Self {
        Self {
            link_rewrite: true,
            audio_only_mode: false,
            audio_only_display_mode: DisplayMode::Text,
        }
    }
}

impl FeatureSettings {
    pub fn get(&self, key: SettingKey) -> SettingValue {
        match key {
            SettingKey::LinkRewrite => SettingValue::Flag(self.link_rewrite),
            SettingKey::AudioOnlyMode => SettingValue::Flag(self.audio_only_mode),
            SettingKey::AudioOnlyDisplayMode => SettingValue::Display(self.audio_only_display_mode),
        }
    }

    /// Writes an already-validated value. Mismatched pairs never come out of `parse_value`.
    fn apply(&mut self, key: SettingKey, value: SettingValue) {
        match (key, value) {
            (SettingKey::LinkRewrite, SettingValue::Flag(v)) => self.link_rewrite = v,
            (SettingKey::AudioOnlyMode, SettingValue::Flag(v)) => self.audio_only_mode = v,
            (SettingKey::AudioOnlyDisplayMode, SettingValue::Display(v)) => {
                self.audio_only_display_mode = v
            }
            (key, value) => {
                tracing::warn!("Ignoring mismatched value {value:?} for {}", key.as_str())
            }
        }
    }

    /// Builds a complete record from whatever is stored, backfilling absent or unusable
    /// keys from the defaults. Canonical keys win over legacy aliases.
    pub fn merge_with_defaults(stored: Option<&Value>) -> Self {
        let mut settings = Self::default();
        let map = match stored {
            None | Some(Value::Null) => return settings,
            Some(Value::Object(map)) => map,
            Some(other) => {
                tracing::warn!("Stored settings record is not an object ({other}); using defaults");
                return settings;
            }
        };

        for key in SettingKey::ALL {
            let raw = map.get(key.as_str()).or_else(|| map.get(key.legacy_name()));
            let Some(raw) = raw else { continue };
            match parse_value(key, raw) {
                Ok(value) => settings.apply(key, value),
                Err(e) => tracing::warn!("Dropping stored value for {}: {e}", key.as_str()),
            }
        }
        settings
    }
}

/// Validate a raw JSON value for `key`.
pub fn parse_value(key: SettingKey, raw: &Value) -> Result<SettingValue, AppError> {
    match key {
        SettingKey::LinkRewrite | SettingKey::AudioOnlyMode => raw
            .as_bool()
            .map(SettingValue::Flag)
            .ok_or_else(|| {
                AppError::InvalidSettingValue(format!("{} must be a boolean, got {raw}", key.as_str()))
            }),
        SettingKey::AudioOnlyDisplayMode => serde_json::from_value::<DisplayMode>(raw.clone())
            .map(SettingValue::Display)
            .map_err(|_| {
                AppError::InvalidSettingValue(format!(
                    "{} must be \"text\" or \"thumbnail\", got {raw}",
                    key.as_str()
                ))
            }),
    }
}

/// One context's view of the settings record.
pub struct SettingsStore {
    storage: Arc<dyn KeyValueStore>,
    current: RwLock<FeatureSettings>,
    /// Records this store has written whose change notification has not come back yet.
    pending_echoes: Mutex<VecDeque<Value>>,
}

impl SettingsStore {
    /// Starts with defaults in memory until `load` succeeds.
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self {
            storage,
            current: RwLock::new(FeatureSettings::default()),
            pending_echoes: Mutex::new(VecDeque::new()),
        }
    }

    /// Load the persisted record, backfill defaults and write the complete record back.
    pub async fn load(&self) -> Result<FeatureSettings, AppError> {
        let stored = self.storage.get(config::SETTINGS_STORAGE_KEY).await?;
        let merged = FeatureSettings::merge_with_defaults(stored.as_ref());
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = merged.clone();

        let record = serde_json::to_value(&merged)?;
        if stored.as_ref() != Some(&record) {
            self.persist(record).await?;
            tracing::info!("Settings record completed and persisted");
        }
        Ok(merged)
    }

    /// Validate, apply in memory, then persist. Returns the previous value.
    pub async fn update(&self, key: SettingKey, raw: &Value) -> Result<SettingValue, AppError> {
        let value = parse_value(key, raw)?;

        let (previous, snapshot) = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            let previous = current.get(key);
            current.apply(key, value);
            (previous, current.clone())
        };

        self.persist(serde_json::to_value(&snapshot)?).await?;
        tracing::debug!("Setting {} updated: {previous:?} -> {value:?}", key.as_str());
        Ok(previous)
    }

    pub fn current(&self) -> FeatureSettings {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, key: SettingKey) -> SettingValue {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
    }

    /// Adopt a record written by another context.
    ///
    /// Returns `(previous, adopted)` when the in-memory record changed. Notifications for
    /// other keys and echoes of this store's own writes return `None`.
    pub fn adopt_external(&self, change: &StorageChange) -> Option<(FeatureSettings, FeatureSettings)> {
        if change.key != config::SETTINGS_STORAGE_KEY {
            return None;
        }

        if let Some(new_value) = change.new_value.as_ref() {
            let mut echoes = self.pending_echoes.lock().unwrap_or_else(PoisonError::into_inner);
            // Notifications arrive in write order, so earlier unmatched echoes were lost.
            if let Some(pos) = echoes.iter().position(|v| v == new_value) {
                if pos > 0 {
                    tracing::debug!("Discarding {pos} settings echoes that never arrived");
                }
                echoes.drain(..=pos);
                return None;
            }
        }

        let adopted = FeatureSettings::merge_with_defaults(change.new_value.as_ref());
        self.replace_current(adopted)
    }

    /// Forget every pending echo and re-read the persisted record.
    ///
    /// Used when change notifications were lost and echo tracking can no longer be trusted.
    /// Returns `(previous, reloaded)` when the in-memory record changed.
    pub async fn resync(&self) -> Result<Option<(FeatureSettings, FeatureSettings)>, AppError> {
        self.pending_echoes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let stored = self.storage.get(config::SETTINGS_STORAGE_KEY).await?;
        Ok(self.replace_current(FeatureSettings::merge_with_defaults(stored.as_ref())))
    }

    /// Number of own writes whose change notification is still outstanding.
    pub fn pending_echo_count(&self) -> usize {
        self.pending_echoes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn replace_current(&self, adopted: FeatureSettings) -> Option<(FeatureSettings, FeatureSettings)> {
        let previous = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, adopted.clone())
        };

        if previous == adopted {
            None
        } else {
            tracing::debug!("Adopted settings record: {adopted:?}");
            Some((previous, adopted))
        }
    }

    async fn persist(&self, record: Value) -> Result<(), AppError> {
        self.pending_echoes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(record.clone());

        if let Err(e) = self
            .storage
            .set(config::SETTINGS_STORAGE_KEY, record.clone())
            .await
        {
            // A failed write produces no notification, so forget its echo.
            let mut echoes = self.pending_echoes.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(pos) = echoes.iter().rposition(|v| *v == record) {
                echoes.remove(pos);
            }
            return Err(e);
        }
        Ok(())
    }
}
