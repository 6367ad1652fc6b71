/* The OS HID collaborator: enumerate FIDO-usage HID devices and read/write
 * fixed-size reports on one. `hidapi` is synchronous, so `Session` (in
 * `transport.rs`) pushes calls through `tokio::task::spawn_blocking` rather
 * than wrapping this trait in `async fn` — that keeps `HidDevice`
 * object-safe and mockable without pulling in `async-trait`.
 *
 * This is the one piece of the spec explicitly named as an external
 * collaborator (OS HID enumeration/IO primitive); everything in this file
 * is the thin adapter around it, not a reimplementation of it. */

use crate::constants::{HID_REPORT_SIZE, HID_USAGE_FIDO, HID_USAGE_PAGE_FIDO};
use crate::error::{ErrorKind, FidoError};

/// One FIDO-capable HID device found during enumeration, before it is
/// opened.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub path: String,
    pub product_string: Option<String>,
}

/// A single open HID device, abstracted so that the transport layer can
/// be driven against an in-memory fake in tests.
///
/// Methods are synchronous on purpose; see the module doc comment.
pub trait HidDevice: Send {
    fn write_report(&mut self, data: &[u8]) -> Result<usize, FidoError>;

    /// Reads one report into `buf`, blocking up to `timeout_ms`
    /// (`-1` blocks indefinitely). Returns `0` on timeout.
    fn read_report_timeout(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<usize, FidoError>;

    fn vendor_id(&self) -> u16;
    fn product_id(&self) -> u16;
}

/// Enumerate every USB-HID device exposing the FIDO usage page, via a
/// fresh `hidapi::HidApi` session.
pub fn enumerate_fido_devices() -> Result<Vec<DeviceDescriptor>, FidoError> {
    let api = hidapi::HidApi::new().map_err(|e| {
        FidoError::new(ErrorKind::NoDevice, format!("failed to initialize HID backend: {e}"))
    })?;

    let devices = api
        .device_list()
        .filter(|info| info.usage_page() == HID_USAGE_PAGE_FIDO && info.usage() == HID_USAGE_FIDO)
        .map(|info| DeviceDescriptor {
            vendor_id: info.vendor_id(),
            product_id: info.product_id(),
            path: info.path().to_string_lossy().into_owned(),
            product_string: info.product_string().map(str::to_string),
        })
        .collect();

    Ok(devices)
}

/// `HidDevice` backed by a real `hidapi::HidDevice`.
pub struct HidapiDevice {
    inner: hidapi::HidDevice,
    vendor_id: u16,
    product_id: u16,
}

impl HidapiDevice {
    pub fn open(descriptor: &DeviceDescriptor) -> Result<Self, FidoError> {
        let api = hidapi::HidApi::new().map_err(|e| {
            FidoError::new(ErrorKind::NoDevice, format!("failed to initialize HID backend: {e}"))
        })?;
        let path = std::ffi::CString::new(descriptor.path.clone()).map_err(|e| {
            FidoError::new(ErrorKind::NoDevice, format!("malformed device path: {e}"))
        })?;
        let inner = api.open_path(&path).map_err(|e| {
            FidoError::new(ErrorKind::NoDevice, format!("failed to open {}: {e}", descriptor.path))
        })?;

        Ok(Self {
            inner,
            vendor_id: descriptor.vendor_id,
            product_id: descriptor.product_id,
        })
    }
}

impl HidDevice for HidapiDevice {
    fn write_report(&mut self, data: &[u8]) -> Result<usize, FidoError> {
        self.inner
            .write(data)
            .map_err(|e| FidoError::new(ErrorKind::InterruptedIo, format!("HID write failed: {e}")))
    }

    fn read_report_timeout(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<usize, FidoError> {
        self.inner
            .read_timeout(buf, timeout_ms)
            .map_err(|e| FidoError::new(ErrorKind::InterruptedIo, format!("HID read failed: {e}")))
    }

    fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    fn product_id(&self) -> u16 {
        self.product_id
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory `HidDevice` for transport/token tests: queue canned
    /// responses in, drain written frames out.
    pub struct MockHidDevice {
        pub vendor_id: u16,
        pub product_id: u16,
        pub inbox: VecDeque<[u8; HID_REPORT_SIZE]>,
        pub outbox: Vec<[u8; HID_REPORT_SIZE]>,
    }

    impl MockHidDevice {
        pub fn new(vendor_id: u16, product_id: u16) -> Self {
            Self {
                vendor_id,
                product_id,
                inbox: VecDeque::new(),
                outbox: Vec::new(),
            }
        }

        pub fn queue_response(&mut self, frame: [u8; HID_REPORT_SIZE]) {
            self.inbox.push_back(frame);
        }
    }

    impl HidDevice for MockHidDevice {
        fn write_report(&mut self, data: &[u8]) -> Result<usize, FidoError> {
            let mut frame = [0u8; HID_REPORT_SIZE];
            let n = data.len().min(HID_REPORT_SIZE);
            frame[..n].copy_from_slice(&data[..n]);
            self.outbox.push(frame);
            Ok(data.len())
        }

        fn read_report_timeout(
            &mut self,
            buf: &mut [u8],
            _timeout_ms: i32,
        ) -> Result<usize, FidoError> {
            match self.inbox.pop_front() {
                Some(frame) => {
                    let n = frame.len().min(buf.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    Ok(n)
                }
                None => Ok(0),
            }
        }

        fn vendor_id(&self) -> u16 {
            self.vendor_id
        }

        fn product_id(&self) -> u16 {
            self.product_id
        }
    }

    #[test]
    fn mock_round_trips_a_written_frame_as_a_queued_response() {
        let mut dev = MockHidDevice::new(0x1234, 0x5678);
        let mut frame = [0u8; HID_REPORT_SIZE];
        frame[0] = 0xAB;
        dev.queue_response(frame);

        let mut buf = [0u8; HID_REPORT_SIZE];
        let n = dev.read_report_timeout(&mut buf, 100).unwrap();
        assert_eq!(n, HID_REPORT_SIZE);
        assert_eq!(buf[0], 0xAB);

        dev.write_report(&[1, 2, 3]).unwrap();
        assert_eq!(&dev.outbox[0][..3], &[1, 2, 3]);
    }

    #[test]
    fn mock_read_times_out_to_zero_when_inbox_empty() {
        let mut dev = MockHidDevice::new(0x1234, 0x5678);
        let mut buf = [0u8; HID_REPORT_SIZE];
        assert_eq!(dev.read_report_timeout(&mut buf, 10).unwrap(), 0);
    }
}
