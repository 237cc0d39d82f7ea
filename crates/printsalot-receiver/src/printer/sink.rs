//! Printer sink: owns the device handle and reports paper/offline
//! conditions separately from other failures.

use std::sync::{Arc, Mutex, PoisonError};

use image::DynamicImage;
use thiserror::Error;
use tracing::{error, info, warn};

use super::device::{DeviceConnector, NullDevice, PrinterDevice};

/// Printer sink errors.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The liveness probe failed before anything was printed.
    #[error("Printer is offline or out of paper: {0}")]
    PaperOrOffline(String),

    #[error("Printer error: {0}")]
    Device(String),
}

struct SinkState {
    device: Box<dyn PrinterDevice>,
    connected: bool,
}

/// Thread-safe wrapper around the physical printer. All methods block and
/// belong on the blocking pool.
///
/// Device access is exclusive: a job holds the device from reacquire to cut,
/// so two jobs never interleave bytes on one printer. Jobs still resolve
/// their content concurrently; only the device I/O waits its turn.
pub struct PrinterSink {
    connector: Arc<dyn DeviceConnector>,
    state: Mutex<SinkState>,
}

impl PrinterSink {
    /// Create the sink and try to open the printer. When that fails the sink
    /// starts on a no-op device and retries on the next job.
    pub fn new(connector: Arc<dyn DeviceConnector>) -> Self {
        let (device, connected) = open(connector.as_ref());
        Self {
            connector,
            state: Mutex::new(SinkState { device, connected }),
        }
    }

    /// True when a real printer was opened and the last job did not fail.
    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Print `image`, then cut if `auto_cut` is set. Any failure marks the
    /// sink disconnected so the next job reopens the device.
    pub fn print(&self, image: &DynamicImage, auto_cut: bool) -> Result<(), SinkError> {
        let mut state = self.lock();

        if !state.connected || state.device.is_fallback() {
            let (device, connected) = open(self.connector.as_ref());
            state.device = device;
            state.connected = connected;
        }
        if state.device.is_fallback() {
            warn!("No printer available, job goes to the fallback device");
        }

        if let Err(e) = state.device.probe() {
            state.connected = false;
            error!(error = %e, "Printer probe failed");
            return Err(SinkError::PaperOrOffline(e.to_string()));
        }

        if let Err(e) = state.device.render(image) {
            state.connected = false;
            error!(error = %e, "Printing image failed");
            return Err(SinkError::Device(e.to_string()));
        }

        if auto_cut {
            if let Err(e) = state.device.cut() {
                state.connected = false;
                error!(error = %e, "Paper cut failed");
                return Err(SinkError::Device(e.to_string()));
            }
        }

        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn open(connector: &dyn DeviceConnector) -> (Box<dyn PrinterDevice>, bool) {
    match connector.acquire() {
        Ok(device) => {
            info!("Printer connected");
            (device, true)
        }
        Err(e) => {
            warn!(error = %e, "Printer not available, using fallback device");
            (Box::new(NullDevice), false)
        }
    }
}

#[cfg(test)]
#[path = "sink_tests.rs"]
mod tests;
