//! Settings handlers: startup load, update requests and external change adoption.

use serde_json::Value;

use crate::core::{SettingKey, SettingValue};
use crate::error::AppError;
use crate::host::messages::Reply;
use crate::host::StorageChange;

use super::logic;
use super::state::ServiceState;

/// Load persisted settings and bring the rule set in line with them.
///
/// Neither step stops the service: an unreachable store leaves the defaults in effect and a
/// rejected rule batch is only logged.
pub async fn initialize(state: &ServiceState) {
    match state.settings.load().await {
        Ok(settings) => tracing::info!("Settings loaded: {settings:?}"),
        Err(e) => tracing::warn!("Settings storage unavailable, continuing with defaults: {e}"),
    }

    let enabled = state.settings.current().audio_only_mode;
    if let Err(e) = state.rules.reconcile(enabled).await {
        tracing::error!("Initial rule reconcile failed: {e}");
    }
}

/// Apply one setting update and reconcile rules when `audioOnlyMode` flips.
pub async fn update_setting(state: &ServiceState, key: &str, value: &Value) -> Result<Reply, AppError> {
    let key = logic::parse_setting_key(key)?;
    let before = state.settings.get(key);

    // The in-memory record changes even when persisting fails, so rules follow it either way.
    let persisted = state.settings.update(key, value).await;
    let current = state.settings.get(key);

    if key == SettingKey::AudioOnlyMode && before != current {
        if let SettingValue::Flag(enabled) = current {
            state.rules.reconcile(enabled).await?;
        }
    }

    let previous = persisted?;
    Ok(Reply::SettingUpdated {
        key,
        previous,
        current,
    })
}

pub fn get_settings(state: &ServiceState) -> Reply {
    Reply::Settings {
        settings: state.settings.current(),
    }
}

/// Adopt a settings record written by another context.
pub async fn apply_external_change(state: &ServiceState, change: &StorageChange) {
    let Some((previous, adopted)) = state.settings.adopt_external(change) else {
        return;
    };
    tracing::info!("Settings changed in another context");

    if let Some(enabled) = logic::audio_only_transition(&previous, &adopted) {
        if let Err(e) = state.rules.reconcile(enabled).await {
            tracing::error!("Rule reconcile after external change failed: {e}");
        }
    }
}

/// Recover from lost change notifications by reloading the persisted record.
pub async fn resync(state: &ServiceState, skipped: u64) {
    tracing::info!("Reloading settings after {skipped} lost change notifications");
    let (previous, reloaded) = match state.settings.resync().await {
        Ok(Some(change)) => change,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!("Settings reload failed, keeping in-memory record: {e}");
            return;
        }
    };

    if let Some(enabled) = logic::audio_only_transition(&previous, &reloaded) {
        if let Err(e) = state.rules.reconcile(enabled).await {
            tracing::error!("Rule reconcile after settings reload failed: {e}");
        }
    }
}
