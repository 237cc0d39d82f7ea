//! Observable session state and lifecycle notifications.

use std::time::Duration;

/// Point-in-time view of the relay session, published on every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// A transport is up and authenticated.
    pub connected: bool,
    /// Code to show the operator for linking; only set while unlinked.
    pub pairing_code: Option<String>,
    pub is_linked: bool,
    /// Wait before the next reconnect attempt.
    pub reconnect_delay: Duration,
    /// Cleared by an explicit disconnect; set by an explicit connect.
    pub should_reconnect: bool,
}

impl SessionSnapshot {
    pub(crate) const fn new(is_linked: bool, reconnect_delay: Duration) -> Self {
        Self {
            connected: false,
            pairing_code: None,
            is_linked,
            reconnect_delay,
            should_reconnect: false,
        }
    }
}

/// Lifecycle notification for display layers. Every subscriber receives
/// every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Connected,
    Disconnected,
    Welcome { code: Option<String>, linked: bool },
    TokenIssued,
    TokenRotated,
    JobReceived { job_id: String },
}
