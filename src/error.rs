//! Unified error type for the coordination service.
//!
//! `AppError` is returned by every settings, rule and message handler. It serializes as
//! `{ "kind": "...", "message": "..." }` so a requesting UI context can distinguish
//! error categories in a one-shot reply.

use serde::ser::SerializeStruct;

/// Application-level error returned by all handlers.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// The host persistence layer could not be read or written.
    #[error("{0}")]
    StorageUnavailable(String),

    /// A setting update named an unknown key or carried a value of the wrong type or range.
    #[error("{0}")]
    InvalidSettingValue(String),

    /// The host rejected a blocking-rule batch. Prior rules are presumed unchanged.
    #[error("{0}")]
    RuleInstallFailed(String),

    /// A response size hint was missing or not a non-negative integer.
    #[error("{0}")]
    MalformedUsageHint(String),

    /// A channel could not deliver a payload.
    #[error("{0}")]
    ChannelClosed(String),
}

impl AppError {
    /// Returns the error kind as a string matching the variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::StorageUnavailable(_) => "StorageUnavailable",
            AppError::InvalidSettingValue(_) => "InvalidSettingValue",
            AppError::RuleInstallFailed(_) => "RuleInstallFailed",
            AppError::MalformedUsageHint(_) => "MalformedUsageHint",
            AppError::ChannelClosed(_) => "ChannelClosed",
        }
    }
}

/// Custom Serialize: produces `{ "kind": "Variant", "message": "..." }` for message replies.
impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

// ---- From implementations for ergonomic error conversion ----

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::StorageUnavailable(format!("{err:#}"))
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::StorageUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::StorageUnavailable(format!("settings record is not valid JSON: {err}"))
    }
}
