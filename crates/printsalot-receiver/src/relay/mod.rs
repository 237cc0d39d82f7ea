//! Relay client for connecting the receiver to the PrintsAlot relay.
//!
//! Provides the authenticated Socket.IO session with automatic reconnection,
//! pairing and token lifecycle handling, and job status reporting.

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod state;
pub mod transport;
pub mod wire;

pub use client::{RelayClient, RelayHandle};
pub use config::{ReconnectPolicy, RelayConfig};
pub use error::RelayError;
pub use protocol::{FailureReason, JobStatus, PrintJob};
pub use state::{RelayEvent, SessionSnapshot};
pub use transport::{Connector, RelayLink, SocketIoConnector};
