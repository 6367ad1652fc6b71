/* Session: the INIT handshake, frame send/receive over a negotiated
 * channel, and the raw Ping/Apdu/Wink/Lock commands (spec §3/§4.1). The
 * token facade and discovery layer drive a device through this, never
 * through raw reports.
 *
 * `hidapi` is synchronous; every call into a `HidDevice` is pushed
 * through `spawn_blocking`, mirroring the teacher's async wrapper around
 * blocking hidraw I/O (`driver::DeviceIo`) but without needing an async
 * trait underneath. */

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::RngCore;
use tracing::{debug, trace, warn};

use crate::constants::{
    capability, command, device_error, CID_BROADCAST, HID_REPORT_SIZE,
};
use crate::error::{ErrorKind, FidoError};
use crate::hid::device_io::HidDevice;
use crate::hid::report::{build_frames, FeedOutcome, Reassembler};

const INIT_NONCE_LEN: usize = 8;
const INIT_RETRY_ATTEMPTS: u32 = 3;
const INIT_RETRY_DELAY: Duration = Duration::from_millis(100);
// Every HID read and write carries a 1-second OS timeout; exceeding it
// is an InterruptedIo error, not a Timeout.
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const READ_TIMEOUT_MS: i32 = 1000;

// An open, channel-negotiated connection to one authenticator.
pub struct Session {
    device: Arc<Mutex<Box<dyn HidDevice>>>,
    channel: u32,
    protocol_version: u8,
    device_version: (u8, u8, u8),
    capabilities: u8,
    vendor_id: u16,
    product_id: u16,
}

fn device_error_to_kind(code: u8) -> ErrorKind {
    match code {
        device_error::MESSAGE_TIMEOUT => ErrorKind::Timeout,
        device_error::CHANNEL_BUSY => ErrorKind::TokenBusy,
        _ => ErrorKind::ProtocolViolation,
    }
}

async fn blocking_write(
    device: Arc<Mutex<Box<dyn HidDevice>>>,
    frame: [u8; HID_REPORT_SIZE],
) -> Result<(), FidoError> {
    let join = tokio::task::spawn_blocking(move || {
        let mut dev = device.lock().expect("HID device mutex poisoned");
        dev.write_report(&frame)
    });
    match tokio::time::timeout(WRITE_TIMEOUT, join).await {
        Ok(Ok(Ok(_))) => Ok(()),
        Ok(Ok(Err(e))) => Err(e),
        Ok(Err(_)) => Err(FidoError::new(ErrorKind::InterruptedIo, "HID write task panicked")),
        Err(_) => Err(FidoError::new(ErrorKind::InterruptedIo, "HID write timed out")),
    }
}

// Blocks up to timeout_ms inside the OS HID call. A timeout is
// InterruptedIo, not a zero-filled frame for the caller to discard.
async fn blocking_read_one(
    device: Arc<Mutex<Box<dyn HidDevice>>>,
    timeout_ms: i32,
) -> Result<[u8; HID_REPORT_SIZE], FidoError> {
    tokio::task::spawn_blocking(move || {
        let mut dev = device.lock().expect("HID device mutex poisoned");
        let mut buf = [0u8; HID_REPORT_SIZE];
        let n = dev.read_report_timeout(&mut buf, timeout_ms)?;
        if n == 0 {
            return Err(FidoError::new(ErrorKind::InterruptedIo, "HID read timed out"));
        }
        Ok(buf)
    })
    .await
    .map_err(|_| FidoError::new(ErrorKind::InterruptedIo, "HID read task panicked"))?
}

impl Session {
    // Runs the INIT broadcast handshake against a freshly opened device.
    // Returns Ok(None) rather than an error on the transient failure modes
    // the discovery layer retries on (timeout, busy, interrupted I/O) —
    // "no session yet" is a normal outcome while nobody has touched the
    // token.
    pub async fn open(device: Box<dyn HidDevice>) -> Result<Option<Self>, FidoError> {
        let vendor_id = device.vendor_id();
        let product_id = device.product_id();
        let device = Arc::new(Mutex::new(device));

        let mut nonce = [0u8; INIT_NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);

        for attempt in 0..INIT_RETRY_ATTEMPTS {
            debug!(attempt, "sending INIT broadcast");
            let frames = build_frames(CID_BROADCAST, command::INIT, &nonce);
            let mut write_failed = false;
            for frame in &frames {
                if let Err(e) = blocking_write(Arc::clone(&device), *frame).await {
                    warn!(error = %e, "INIT write failed, will retry");
                    write_failed = true;
                    break;
                }
            }
            if write_failed {
                tokio::time::sleep(INIT_RETRY_DELAY).await;
                continue;
            }

            let mut reasm = Reassembler::new(CID_BROADCAST, command::INIT);
            loop {
                let frame = match blocking_read_one(Arc::clone(&device), READ_TIMEOUT_MS).await {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "INIT read failed, will retry");
                        break;
                    }
                };
                trace!(?frame, "INIT rx frame");

                match reasm.feed(&frame) {
                    Ok(FeedOutcome::Done(body)) => {
                        if body.len() < INIT_NONCE_LEN + 9 || body[..INIT_NONCE_LEN] != nonce {
                            // Stray response to someone else's INIT race; keep waiting.
                            reasm = Reassembler::new(CID_BROADCAST, command::INIT);
                            continue;
                        }
                        let channel = u32::from_be_bytes([
                            body[8], body[9], body[10], body[11],
                        ]);
                        let protocol_version = body[12];
                        let device_version = (body[13], body[14], body[15]);
                        let capabilities = body[16];

                        debug!(channel, protocol_version, capabilities, "INIT handshake complete");
                        return Ok(Some(Self {
                            device,
                            channel,
                            protocol_version,
                            device_version,
                            capabilities,
                            vendor_id,
                            product_id,
                        }));
                    }
                    Ok(FeedOutcome::Ignored) | Ok(FeedOutcome::NeedMore) => continue,
                    Ok(FeedOutcome::ErrorFrame(code)) => {
                        warn!(code, "INIT handshake got an ERROR frame, retrying");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "INIT handshake protocol violation, retrying");
                        break;
                    }
                }
            }

            tokio::time::sleep(INIT_RETRY_DELAY).await;
        }

        Ok(None)
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    pub fn device_version(&self) -> (u8, u8, u8) {
        self.device_version
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.product_id
    }

    pub fn supports_wink(&self) -> bool {
        self.capabilities & capability::WINK != 0
    }

    pub fn supports_lock(&self) -> bool {
        self.capabilities & capability::LOCK != 0
    }

    pub fn device_name(&self) -> Option<String> {
        crate::device_db::lookup(self.vendor_id, self.product_id)
    }

    async fn send(&self, cmd: u8, payload: &[u8]) -> Result<(), FidoError> {
        for frame in build_frames(self.channel, cmd, payload) {
            blocking_write(Arc::clone(&self.device), frame).await?;
        }
        Ok(())
    }

    async fn receive(&self, expected_command: u8) -> Result<Vec<u8>, FidoError> {
        let mut reasm = Reassembler::new(self.channel, expected_command);

        loop {
            let frame = blocking_read_one(Arc::clone(&self.device), READ_TIMEOUT_MS).await?;
            trace!(?frame, "rx frame");

            match reasm.feed(&frame)? {
                FeedOutcome::Done(body) => return Ok(body),
                FeedOutcome::Ignored | FeedOutcome::NeedMore => continue,
                FeedOutcome::ErrorFrame(code) => {
                    return Err(FidoError::new(
                        device_error_to_kind(code),
                        format!("device returned ERROR frame 0x{code:02X}"),
                    ));
                }
            }
        }
    }

    pub async fn ping(&self, data: &[u8]) -> Result<Vec<u8>, FidoError> {
        self.send(command::PING, data).await?;
        self.receive(command::PING).await
    }

    // Interpreting the response (status word, payload) is the token
    // facade's job.
    pub async fn apdu(&self, data: &[u8]) -> Result<Vec<u8>, FidoError> {
        self.send(command::APDU, data).await?;
        self.receive(command::APDU).await
    }

    pub async fn wink(&self) -> Result<(), FidoError> {
        if !self.supports_wink() {
            return Err(FidoError::new(
                ErrorKind::UnsupportedOperation,
                "device does not advertise the WINK capability",
            ));
        }
        self.send(command::WINK, &[]).await?;
        self.receive(command::WINK).await?;
        Ok(())
    }

    // seconds in 1..=10 locks, 0 releases.
    pub async fn lock(&self, seconds: u8) -> Result<(), FidoError> {
        if !self.supports_lock() {
            return Err(FidoError::new(
                ErrorKind::UnsupportedOperation,
                "device does not advertise the LOCK capability",
            ));
        }
        if seconds > 10 {
            return Err(FidoError::new(
                ErrorKind::UnsupportedOperation,
                "lock duration must be between 0 (release) and 10 seconds",
            ));
        }
        self.send(command::LOCK, &[seconds]).await?;
        self.receive(command::LOCK).await?;
        Ok(())
    }

    pub async fn unlock(&self) -> Result<(), FidoError> {
        self.lock(0).await
    }
}
