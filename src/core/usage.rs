//! Per-tab data usage accounting using DashMap.
//!
//! Tracks cumulative response bytes per tab since its last navigation-start. Absence of
//! an entry means zero usage.

use dashmap::DashMap;

/// Host-assigned tab identifier. Non-positive ids mark requests with no owning tab.
pub type TabId = i64;

/// Whether `tab_id` names a real tab.
pub fn is_valid_tab(tab_id: TabId) -> bool {
    tab_id > 0
}

/// Running byte totals keyed by tab id.
pub struct TabUsageLedger {
    counters: DashMap<TabId, u64>,
}

impl TabUsageLedger {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    /// Reset the counter to zero, creating the entry if absent. Non-tab ids are ignored.
    pub fn on_navigation_start(&self, tab_id: TabId) {
        if is_valid_tab(tab_id) {
            self.counters.insert(tab_id, 0);
        }
    }

    /// Add `bytes` to the tab's total. Returns the new total, or `None` if the request
    /// is not attributable to a tab.
    pub fn on_response(&self, tab_id: TabId, bytes: u64) -> Option<u64> {
        if !is_valid_tab(tab_id) {
            return None;
        }
        let mut total = self.counters.entry(tab_id).or_insert(0);
        *total = total.saturating_add(bytes);
        Some(*total)
    }

    /// Drop the tab's entry. Returns the usage it had accrued, if any.
    pub fn on_tab_closed(&self, tab_id: TabId) -> Option<u64> {
        self.counters.remove(&tab_id).map(|(_, total)| total)
    }

    pub fn current(&self, tab_id: TabId) -> u64 {
        self.counters.get(&tab_id).map(|r| *r).unwrap_or(0)
    }

    /// Number of tabs with an entry.
    pub fn tracked_tabs(&self) -> usize {
        self.counters.len()
    }
}

impl Default for TabUsageLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a byte count in a compact human-readable form.
pub fn format_bytes_compact(bytes: u64) -> String {
    let b = bytes as f64;
    if b < 1024.0 {
        format!("{bytes} B")
    } else if b < 1024.0 * 1024.0 {
        format!("{:.1} KB", b / 1024.0)
    } else if b < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", b / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", b / (1024.0 * 1024.0 * 1024.0))
    }
}
