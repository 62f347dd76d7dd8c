//! Tab lifecycle and response accounting handlers.

use crate::core::rules::ResourceKind;
use crate::core::usage::format_bytes_compact;
use crate::core::TabId;
use crate::host::messages::{ChannelPayload, HttpHeader, Reply};

use super::logic;
use super::state::ServiceState;

pub fn navigation_started(state: &ServiceState, tab_id: TabId, url: Option<&str>) {
    state.usage.on_navigation_start(tab_id);
    tracing::debug!("Tab {tab_id} navigating to {}", url.unwrap_or("<unknown>"));
}

/// Account a response and push the new total to the tab's subscriber.
///
/// Returns the tab's new total, or `None` when the response was not accounted.
pub fn response_received(
    state: &ServiceState,
    tab_id: TabId,
    url: &str,
    resource_kind: Option<ResourceKind>,
    headers: &[HttpHeader],
) -> Option<u64> {
    let bytes = match logic::parse_content_length(headers) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::trace!("No usage hint for {url}: {e}");
            return None;
        }
    };

    let total = state.usage.on_response(tab_id, bytes)?;
    tracing::trace!(
        "Tab {tab_id} +{bytes} B ({resource_kind:?}) = {}",
        format_bytes_compact(total)
    );
    state
        .subscribers
        .notify(tab_id, &ChannelPayload::DataUsageUpdate { usage: total });
    Some(total)
}

pub fn tab_closed(state: &ServiceState, tab_id: TabId) {
    let accrued = state.usage.on_tab_closed(tab_id);
    state.subscribers.remove_tab(tab_id);
    if let Some(total) = accrued {
        tracing::debug!("Tab {tab_id} closed after {}", format_bytes_compact(total));
    }
}

pub fn get_usage(state: &ServiceState, tab_id: TabId) -> Reply {
    Reply::Usage {
        tab_id,
        usage: state.usage.current(tab_id),
    }
}
