//! Event handlers, organized by functional domain.
//!
//! - `settings`: load at startup, update requests, external change adoption
//! - `usage`: navigation, response accounting, tab close, usage queries
//! - `channel`: usage port handshake and disconnect
//! - `logic`: Pure decision functions (unit-testable)
//! - `state`: Shared `ServiceState` definition

pub(crate) mod channel;
pub(crate) mod logic;
pub(crate) mod settings;
mod state;
pub(crate) mod usage;

pub use state::{PortSession, ServiceState};
