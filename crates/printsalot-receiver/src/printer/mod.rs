//! Receipt printer output: device layer, ESC/POS encoding and the sink
//! used by print jobs.

pub mod device;
pub mod escpos;
pub mod sink;

pub use device::{DeviceConnector, NullDevice, PrinterDevice};
pub use escpos::{EscPosConnector, EscPosDevice};
pub use sink::{PrinterSink, SinkError};
