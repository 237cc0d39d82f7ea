//! `PrintsAlot` Core Library
//!
//! Shared functionality for the `PrintsAlot` receiver:
//! - Durable credential and settings store
//! - Printer settings model with relay defaults
//! - Common error types
//! - Tracing initialisation

pub mod config;
pub mod error;
pub mod settings;
pub mod tracing_init;

pub use config::{ConfigStore, DeviceConfig, DeviceKind, ReceiverConfig};
pub use error::{Error, Result};
pub use settings::PrinterSettings;
