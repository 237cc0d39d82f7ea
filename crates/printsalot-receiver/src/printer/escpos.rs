//! ESC/POS receipt printer output.
//!
//! Images are printed as 1-bit raster graphics (`GS v 0`) in bands of at
//! most [`MAX_BAND_ROWS`] rows, which every TM-series printer accepts.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use image::imageops::{self, BiLevel, FilterType};
use image::{DynamicImage, GrayImage, Luma};
use tracing::{debug, info};

use printsalot_core::{ConfigStore, DeviceKind};

use super::device::{DeviceConnector, PrinterDevice};

const ESC: u8 = 0x1B;
const GS: u8 = 0x1D;

/// `ESC @`: reset the printer to its power-on state.
const INIT: [u8; 2] = [ESC, b'@'];
/// A bare line feed. Fails fast on a printer that is offline or out of paper.
const PROBE: [u8; 1] = [b'\n'];
/// `GS V B 0`: feed to the cutter and partial cut.
const FEED_AND_CUT: [u8; 4] = [GS, b'V', b'B', 0];

/// Rows per `GS v 0` command.
pub const MAX_BAND_ROWS: usize = 256;

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const TCP_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Packed 1-bit image, MSB first, black = 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    pub width_bytes: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

/// Scale `image` down to `max_width` dots if needed, flatten transparency
/// onto white and dither to black and white.
pub fn rasterize(image: &DynamicImage, max_width: u32) -> Raster {
    let scaled;
    let image = if max_width > 0 && image.width() > max_width {
        let height =
            u64::from(image.height()) * u64::from(max_width) / u64::from(image.width());
        let height = u32::try_from(height).unwrap_or(u32::MAX).max(1);
        scaled = image.resize_exact(max_width, height, FilterType::Triangle);
        &scaled
    } else {
        image
    };

    let mut gray = flatten_to_luma(image);
    imageops::dither(&mut gray, &BiLevel);

    let width = gray.width() as usize;
    let height = gray.height() as usize;
    let width_bytes = width.div_ceil(8);
    let mut data = vec![0u8; width_bytes * height];
    for (x, y, Luma([level])) in gray.enumerate_pixels() {
        if *level < 128 {
            let (x, y) = (x as usize, y as usize);
            data[y * width_bytes + x / 8] |= 0x80 >> (x % 8);
        }
    }
    Raster {
        width_bytes,
        height,
        data,
    }
}

fn flatten_to_luma(image: &DynamicImage) -> GrayImage {
    let rgba = image.to_rgba8();
    GrayImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let luma = (299 * u32::from(r) + 587 * u32::from(g) + 114 * u32::from(b)) / 1000;
        let alpha = u32::from(a);
        let blended = (luma * alpha + 255 * (255 - alpha)) / 255;
        Luma([u8::try_from(blended).unwrap_or(u8::MAX)])
    })
}

/// Append `GS v 0` commands for `raster` to `out`.
pub fn encode_raster(raster: &Raster, out: &mut Vec<u8>) {
    if raster.width_bytes == 0 || raster.height == 0 {
        return;
    }
    let x = u16::try_from(raster.width_bytes)
        .unwrap_or(u16::MAX)
        .to_le_bytes();
    for band in raster.data.chunks(raster.width_bytes * MAX_BAND_ROWS) {
        let rows = u16::try_from(band.len() / raster.width_bytes)
            .unwrap_or(u16::MAX)
            .to_le_bytes();
        out.extend_from_slice(&[GS, b'v', b'0', 0, x[0], x[1], rows[0], rows[1]]);
        out.extend_from_slice(band);
    }
}

/// ESC/POS printer on any byte sink.
#[derive(Debug)]
pub struct EscPosDevice<W> {
    out: W,
    width: u32,
}

impl<W: Write> EscPosDevice<W> {
    /// Wrap an opened printer. `width` is the printable width in dots.
    /// Nothing is written until the first probe.
    pub const fn new(out: W, width: u32) -> Self {
        Self { out, width }
    }

    pub const fn get_ref(&self) -> &W {
        &self.out
    }
}

impl<W: Write + Send> PrinterDevice for EscPosDevice<W> {
    /// Reset the printer and feed one line. A printer that is out of paper
    /// or offline fails this write.
    fn probe(&mut self) -> io::Result<()> {
        self.out.write_all(&INIT)?;
        self.out.write_all(&PROBE)?;
        self.out.flush()
    }

    fn render(&mut self, image: &DynamicImage) -> io::Result<()> {
        let raster = rasterize(image, self.width);
        let mut buf = Vec::with_capacity(raster.data.len() + 16);
        encode_raster(&raster, &mut buf);
        debug!(
            width_dots = raster.width_bytes * 8,
            rows = raster.height,
            bytes = buf.len(),
            "Sending raster image"
        );
        self.out.write_all(&buf)?;
        self.out.flush()
    }

    fn cut(&mut self) -> io::Result<()> {
        self.out.write_all(&FEED_AND_CUT)?;
        self.out.flush()
    }
}

/// Opens the printer named in the configuration store. The device and
/// width are re-read on every acquire.
#[derive(Debug, Clone)]
pub struct EscPosConnector {
    store: Arc<ConfigStore>,
}

impl EscPosConnector {
    pub const fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }
}

impl DeviceConnector for EscPosConnector {
    fn acquire(&self) -> io::Result<Box<dyn PrinterDevice>> {
        let device = self.store.device();
        let width = self.store.printer_settings().width;
        info!(device = %device, width, "Opening printer");
        match device.kind {
            DeviceKind::File => {
                let file = OpenOptions::new().append(true).open(&device.target)?;
                Ok(Box::new(EscPosDevice::new(file, width)))
            }
            DeviceKind::Tcp => {
                let stream = connect_tcp(&device.target)?;
                stream.set_write_timeout(Some(TCP_WRITE_TIMEOUT))?;
                stream.set_nodelay(true)?;
                Ok(Box::new(EscPosDevice::new(stream, width)))
            }
        }
    }
}

fn connect_tcp(target: &str) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in target.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, TCP_CONNECT_TIMEOUT) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{target} did not resolve to any address"),
        )
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Read;
    use std::net::TcpListener;

    use image::{Rgba, RgbaImage};
    use printsalot_core::{DeviceConfig, PrinterSettings, ReceiverConfig};

    use super::*;
    use crate::printer::{PrinterSink, SinkError};

    fn solid(width: u32, height: u32, pixel: Rgba<u8>) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, pixel))
    }

    const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);

    #[test]
    fn black_image_packs_to_set_bits() {
        let raster = rasterize(&solid(10, 2, BLACK), 384);
        assert_eq!(raster.width_bytes, 2);
        assert_eq!(raster.height, 2);
        // Trailing padding bits stay white.
        assert_eq!(raster.data, vec![0xFF, 0xC0, 0xFF, 0xC0]);
    }

    #[test]
    fn transparent_pixels_print_white() {
        let raster = rasterize(&solid(8, 1, Rgba([0, 0, 0, 0])), 384);
        assert_eq!(raster.data, vec![0x00]);
    }

    #[test]
    fn white_image_is_blank() {
        let raster = rasterize(&solid(16, 3, Rgba([255, 255, 255, 255])), 384);
        assert!(raster.data.iter().all(|b| *b == 0));
    }

    #[test]
    fn wide_images_are_scaled_to_printer_width() {
        let raster = rasterize(&solid(768, 100, BLACK), 384);
        assert_eq!(raster.width_bytes, 48);
        assert_eq!(raster.height, 50);
    }

    #[test]
    fn narrow_images_keep_their_size() {
        let raster = rasterize(&solid(100, 20, BLACK), 384);
        assert_eq!(raster.width_bytes, 13);
        assert_eq!(raster.height, 20);
    }

    #[test]
    fn mid_gray_is_dithered() {
        let raster = rasterize(&solid(64, 64, Rgba([128, 128, 128, 255])), 384);
        let black = raster.data.iter().map(|b| b.count_ones()).sum::<u32>();
        let total = 64 * 64;
        assert!(black > total / 4 && black < total * 3 / 4, "black dots: {black}");
    }

    #[test]
    fn tall_images_are_split_into_bands() {
        let raster = Raster {
            width_bytes: 2,
            height: 300,
            data: vec![0xAA; 600],
        };
        let mut out = Vec::new();
        encode_raster(&raster, &mut out);

        assert_eq!(&out[..8], &[GS, b'v', b'0', 0, 2, 0, 0, 1]);
        let second = 8 + 2 * 256;
        assert_eq!(&out[second..second + 8], &[GS, b'v', b'0', 0, 2, 0, 44, 0]);
        assert_eq!(out.len(), 16 + 600);
    }

    #[test]
    fn empty_raster_encodes_nothing() {
        let mut out = Vec::new();
        encode_raster(
            &Raster {
                width_bytes: 0,
                height: 0,
                data: Vec::new(),
            },
            &mut out,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn device_writes_init_image_and_cut() {
        let mut device = EscPosDevice::new(Vec::new(), 384);
        device.probe().unwrap();
        device.render(&solid(8, 1, BLACK)).unwrap();
        device.cut().unwrap();

        let mut expected = vec![ESC, b'@', b'\n'];
        expected.extend_from_slice(&[GS, b'v', b'0', 0, 1, 0, 1, 0, 0xFF]);
        expected.extend_from_slice(&FEED_AND_CUT);
        assert_eq!(device.get_ref(), &expected);
    }

    /// Opens fine, rejects every write like a printer out of paper.
    struct FullWriter;

    impl Write for FullWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from_raw_os_error(28))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct FullPrinter;

    impl DeviceConnector for FullPrinter {
        fn acquire(&self) -> io::Result<Box<dyn PrinterDevice>> {
            Ok(Box::new(EscPosDevice::new(FullWriter, 384)))
        }
    }

    #[test]
    fn opening_a_device_writes_nothing() {
        let device = EscPosDevice::new(Vec::new(), 384);
        assert!(device.get_ref().is_empty());
    }

    #[test]
    fn rejected_writes_fail_the_probe() {
        let mut device = EscPosDevice::new(FullWriter, 384);
        assert!(device.probe().is_err());
    }

    #[test]
    fn rejected_writes_are_paper_or_offline_on_every_job() {
        let sink = PrinterSink::new(Arc::new(FullPrinter));
        let image = solid(8, 8, BLACK);

        for _ in 0..2 {
            let err = sink.print(&image, true).unwrap_err();
            assert!(matches!(err, SinkError::PaperOrOffline(_)), "got {err:?}");
            assert!(!sink.is_connected());
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn full_device_file_is_paper_or_offline() {
        let connector = EscPosConnector::new(store_for(DeviceConfig {
            kind: DeviceKind::File,
            target: "/dev/full".into(),
        }));
        let sink = PrinterSink::new(Arc::new(connector));
        let image = solid(8, 8, BLACK);

        for _ in 0..2 {
            let err = sink.print(&image, false).unwrap_err();
            assert!(matches!(err, SinkError::PaperOrOffline(_)), "got {err:?}");
        }
    }

    fn store_for(device: DeviceConfig) -> Arc<ConfigStore> {
        Arc::new(ConfigStore::in_memory(ReceiverConfig {
            device,
            printer_settings: PrinterSettings {
                width: 8,
                ..PrinterSettings::default()
            },
            ..ReceiverConfig::default()
        }))
    }

    #[test]
    fn connector_opens_file_device() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lp0");
        std::fs::write(&path, b"").unwrap();

        let connector = EscPosConnector::new(store_for(DeviceConfig {
            kind: DeviceKind::File,
            target: path.display().to_string(),
        }));
        let mut device = connector.acquire().unwrap();
        assert!(std::fs::read(&path).unwrap().is_empty());
        device.probe().unwrap();
        device.cut().unwrap();
        drop(device);

        let written = std::fs::read(&path).unwrap();
        assert_eq!(written, [&INIT[..], &PROBE[..], &FEED_AND_CUT[..]].concat());
    }

    #[test]
    fn connector_fails_for_missing_file_device() {
        let connector = EscPosConnector::new(store_for(DeviceConfig {
            kind: DeviceKind::File,
            target: "/nonexistent/printsalot/lp0".into(),
        }));
        assert!(connector.acquire().is_err());
    }

    #[test]
    fn connector_opens_tcp_device() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut received = Vec::new();
            socket.read_to_end(&mut received).unwrap();
            received
        });

        let connector = EscPosConnector::new(store_for(DeviceConfig {
            kind: DeviceKind::Tcp,
            target: addr.to_string(),
        }));
        let mut device = connector.acquire().unwrap();
        device.probe().unwrap();
        drop(device);

        assert_eq!(server.join().unwrap(), vec![ESC, b'@', b'\n']);
    }
}
