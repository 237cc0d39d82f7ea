//! PrintsAlot Receiver Library
//!
//! Connects a receipt printer to the PrintsAlot relay:
//! - Relay session with pairing, token lifecycle and automatic reconnection
//! - Print job dispatch with exactly one status report per job
//! - Image content resolution (download or embedded base64)
//! - ESC/POS printer output with offline/out-of-paper detection
//! - Update check

pub mod content;
pub mod job;
pub mod printer;
pub mod relay;
pub mod version;

/// HTTP client builder with the TLS provider installed and the receiver's
/// user agent set.
pub fn http_client_builder() -> reqwest::ClientBuilder {
    // reqwest is built without a default provider; `Err` means one is
    // already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();
    reqwest::Client::builder().user_agent(concat!(
        "printsalot-receiver/",
        env!("CARGO_PKG_VERSION")
    ))
}

/// Shared HTTP client for image downloads and update checks.
pub fn http_client() -> reqwest::Result<reqwest::Client> {
    http_client_builder().build()
}
