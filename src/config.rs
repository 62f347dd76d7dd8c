//! Centralized runtime constants for tabwatch.
//!
//! Storage keys, rule identifiers, channel names and queue sizes live here so they can be
//! found and adjusted in one place rather than scattered across modules.

use std::path::PathBuf;

/// Storage key holding the single persisted settings record.
pub const SETTINGS_STORAGE_KEY: &str = "featureSettings";

/// Name a UI context must give its long-lived channel to receive usage updates.
pub const DATA_USAGE_PORT_NAME: &str = "data_usage_port";

/// Response header carrying the advisory body size.
pub const CONTENT_LENGTH_HEADER: &str = "content-length";

/// Rule id blocking media responses from the video-serving domain.
pub const VIDEO_RULE_ID: u32 = 1;

/// Rule id blocking storyboard preview images.
pub const STORYBOARD_RULE_ID: u32 = 2;

/// Priority shared by both blocking rules.
pub const BLOCK_RULE_PRIORITY: u32 = 1;

/// Request URL pattern for video playback segments.
pub const VIDEO_URL_PATTERN: &str = r"^https?://[^/]*\.googlevideo\.com/videoplayback";

/// Request URL pattern for seek-bar storyboard thumbnails.
pub const STORYBOARD_URL_PATTERN: &str = r"^https?://i\.ytimg\.com/.*/storyboard";

/// Capacity of the host event queue feeding the dispatch loop.
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Capacity of the storage change-notification broadcast.
pub const STORAGE_CHANGE_CAPACITY: usize = 64;

/// Log filter used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "tabwatch=info,tabwatch_lib=info";

/// Environment variable overriding the location of the local SQLite settings mirror.
pub const DB_PATH_ENV: &str = "TABWATCH_DB_PATH";

/// Database file used when `TABWATCH_DB_PATH` is not set.
pub const DEFAULT_DB_PATH: &str = "tabwatch.db";

/// Process-level settings resolved at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub db_path: PathBuf,
    pub event_queue_capacity: usize,
}

impl ServiceConfig {
    /// Resolve from the environment, falling back to the defaults above.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let db_path = lookup(DB_PATH_ENV)
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        Self {
            db_path: PathBuf::from(db_path),
            event_queue_capacity: EVENT_QUEUE_CAPACITY,
        }
    }
}
