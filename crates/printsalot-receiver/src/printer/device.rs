//! Device layer consumed by the printer sink.

use std::io;

use image::DynamicImage;
use tracing::debug;

/// An open handle to a receipt printer. Calls block; the sink only uses
/// devices from blocking job context.
pub trait PrinterDevice: Send {
    /// Cheap liveness check that must not print anything visible.
    fn probe(&mut self) -> io::Result<()>;

    /// Print a bitmap.
    fn render(&mut self, image: &DynamicImage) -> io::Result<()>;

    /// Feed and cut the paper.
    fn cut(&mut self) -> io::Result<()>;

    /// True for the no-op stand-in used when no printer is reachable.
    fn is_fallback(&self) -> bool {
        false
    }
}

/// Opens printer devices.
pub trait DeviceConnector: Send + Sync + 'static {
    fn acquire(&self) -> io::Result<Box<dyn PrinterDevice>>;
}

/// Accepts everything and prints nothing.
#[derive(Debug, Default)]
pub struct NullDevice;

impl PrinterDevice for NullDevice {
    fn probe(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn render(&mut self, image: &DynamicImage) -> io::Result<()> {
        debug!(
            width = image.width(),
            height = image.height(),
            "Discarding image on fallback printer"
        );
        Ok(())
    }

    fn cut(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn is_fallback(&self) -> bool {
        true
    }
}
