/* Discovery & parallel driver: poll for devices, open sessions, retry
 * across hot-plug events, and fan an operation out across every
 * currently-plugged authenticator (spec §4.5/§5).
 *
 * Per-device task fan-out is message-passing, not shared state: each
 * task posts its outcome on an mpsc channel and the coordinator reads
 * until the first success, mirroring the teacher's actor pattern
 * (`actor.rs`) rather than sharing a mutex across tasks. */

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, FidoError};
use crate::hid::device_io::{enumerate_fido_devices, HidapiDevice};
use crate::hid::{HidDevice, Session};

const ENUMERATION_POLL_INTERVAL: Duration = Duration::from_millis(200);
const PARALLEL_RECHECK_INTERVAL: Duration = Duration::from_secs(5);
const PROGRESS_EMIT_INTERVAL: Duration = Duration::from_millis(500);

async fn open_every_present_device() -> Vec<Session> {
    let descriptors = match enumerate_fido_devices() {
        Ok(d) => d,
        Err(e) => {
            warn!(error = %e, "device enumeration failed");
            return Vec::new();
        }
    };

    let mut sessions = Vec::new();
    for descriptor in descriptors {
        let device: Box<dyn HidDevice> = match HidapiDevice::open(&descriptor) {
            Ok(d) => Box::new(d),
            Err(e) => {
                warn!(error = %e, path = %descriptor.path, "failed to open device, skipping");
                continue;
            }
        };
        match Session::open(device).await {
            Ok(Some(session)) => {
                info!(
                    vendor_id = session.vendor_id(),
                    product_id = session.product_id(),
                    "opened session"
                );
                sessions.push(session);
            }
            Ok(None) => debug!(path = %descriptor.path, "device present but INIT yielded no session"),
            Err(e) => warn!(error = %e, path = %descriptor.path, "INIT handshake failed"),
        }
    }
    sessions
}

/// Poll enumeration every 200ms until one device opens a session, or
/// `cancel` fires.
pub async fn wait_for_device(cancel: &CancellationToken) -> Option<Session> {
    loop {
        if cancel.is_cancelled() {
            return None;
        }

        let mut sessions = open_every_present_device().await;
        if let Some(session) = sessions.pop() {
            return Some(session);
        }

        tokio::select! {
            _ = tokio::time::sleep(ENUMERATION_POLL_INTERVAL) => {}
            _ = cancel.cancelled() => return None,
        }
    }
}

/// Same polling loop, but returns every device that opens on the first
/// successful poll cycle.
pub async fn wait_for_devices(cancel: &CancellationToken) -> Vec<Session> {
    loop {
        if cancel.is_cancelled() {
            return Vec::new();
        }

        let sessions = open_every_present_device().await;
        if !sessions.is_empty() {
            return sessions;
        }

        tokio::select! {
            _ = tokio::time::sleep(ENUMERATION_POLL_INTERVAL) => {}
            _ = cancel.cancelled() => return Vec::new(),
        }
    }
}

/// Waits for one device, runs `op` on it, and releases it. Transient
/// failures (Timeout/TokenBusy/InterruptedIo) restart the wait from
/// scratch; anything else propagates.
pub async fn wait_for_first_token_then<T, F, Fut>(
    cancel: &CancellationToken,
    mut op: F,
) -> Result<Option<T>, FidoError>
where
    F: FnMut(Session) -> Fut,
    Fut: Future<Output = Result<T, FidoError>>,
{
    loop {
        let Some(session) = wait_for_device(cancel).await else {
            return Ok(None);
        };

        match op(session).await {
            Ok(value) => return Ok(Some(value)),
            Err(e) if e.is_transient_discovery_failure() => {
                debug!(error = %e, "transient failure, retrying wait-for-token");
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Outcome of one device's task inside a `run_parallel` round.
enum TaskOutcome<T> {
    Success(T),
    Ignored,
    InvalidKeyHandle,
    Failed(FidoError),
}

/// Links `child` to `parent` so that cancelling either cancels `child`.
/// `tokio_util::sync::CancellationToken` only exposes single-parent
/// `child_token()`, so the `parent`-side half of the union is wired with
/// a small watcher task instead of a literal two-parent merge.
fn link_cancellation(child: &CancellationToken, parent: &CancellationToken) {
    let child = child.clone();
    let parent = parent.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = parent.cancelled() => child.cancel(),
            _ = child.cancelled() => {}
        }
    });
}

/// Outcome of one call to `run_round`.
enum RoundOutcome<T> {
    Winner(T),
    Failure(FidoError),
    NoWinner,
}

/// Runs `op` against every session in `sessions` in parallel and returns
/// as soon as there's a winner, a hard failure, or nothing left to wait
/// on (recheck timer fired or `cancel` fired with no result). Split out
/// from `run_parallel` so the fan-out/race logic can be driven directly
/// against hand-built sessions in tests, without the enumeration polling
/// loop that needs real HID hardware.
async fn run_round<T, F, Fut>(
    sessions: Vec<Session>,
    cancel: &CancellationToken,
    op: &mut F,
    on_invalid_count: &mut impl FnMut(u32),
) -> RoundOutcome<T>
where
    T: Send + 'static,
    F: FnMut(Session, CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, FidoError>> + Send + 'static,
{
    let round_cancel = CancellationToken::new();
    let recheck_timer = tokio::time::sleep(PARALLEL_RECHECK_INTERVAL);
    tokio::pin!(recheck_timer);

    let (tx, mut rx) = mpsc::channel::<TaskOutcome<T>>(sessions.len().max(1));
    let invalid_count = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::with_capacity(sessions.len());
    for session in sessions {
        let task_cancel = round_cancel.child_token();
        link_cancellation(&task_cancel, cancel);
        let tx = tx.clone();
        let fut = op(session, task_cancel);
        handles.push(tokio::spawn(async move {
            let outcome = match fut.await {
                Ok(value) => TaskOutcome::Success(value),
                Err(e) if e.kind() == ErrorKind::InvalidKeyHandle => TaskOutcome::InvalidKeyHandle,
                Err(e) if e.is_transient_discovery_failure() => TaskOutcome::Ignored,
                Err(e) => TaskOutcome::Failed(e),
            };
            let _ = tx.send(outcome).await;
        }));
    }
    drop(tx);

    let progress_invalid_count = Arc::clone(&invalid_count);
    let mut progress_ticker = tokio::time::interval(PROGRESS_EMIT_INTERVAL);

    let mut winner: Option<T> = None;
    let mut failure: Option<FidoError> = None;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                round_cancel.cancel();
                break;
            }
            _ = &mut recheck_timer => {
                debug!("parallel round recheck timer fired, restarting round");
                round_cancel.cancel();
                break;
            }
            _ = progress_ticker.tick() => {
                on_invalid_count(progress_invalid_count.load(Ordering::Relaxed));
            }
            outcome = rx.recv() => {
                match outcome {
                    Some(TaskOutcome::Success(value)) => {
                        winner = Some(value);
                        round_cancel.cancel();
                        break;
                    }
                    Some(TaskOutcome::InvalidKeyHandle) => {
                        invalid_count.fetch_add(1, Ordering::Relaxed);
                    }
                    Some(TaskOutcome::Ignored) => {}
                    Some(TaskOutcome::Failed(e)) => {
                        failure = Some(e);
                        round_cancel.cancel();
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    for handle in handles {
        let _ = handle.await;
    }

    on_invalid_count(invalid_count.load(Ordering::Relaxed));

    if let Some(value) = winner {
        RoundOutcome::Winner(value)
    } else if let Some(e) = failure {
        RoundOutcome::Failure(e)
    } else {
        RoundOutcome::NoWinner
    }
}

/// Runs `op` against every currently-present device in parallel,
/// repeating rounds until one device succeeds or `cancel` fires.
///
/// Each task gets its own cancellation token that fires when the round
/// restarts (new device plugged, recheck timer, a sibling task's
/// failure) or when `cancel` fires, so `op`'s own cancellation-aware
/// retry loop (e.g. `Token::register`'s user-presence wait) can return
/// promptly instead of having its future dropped mid-flight.
///
/// `on_invalid_count` is called with the running per-round count of
/// `InvalidKeyHandle` outcomes every 500ms, mirroring the progress sink
/// in spec §4.5 step 3.
pub async fn run_parallel<T, F, Fut>(
    cancel: &CancellationToken,
    mut op: F,
    mut on_invalid_count: impl FnMut(u32) + Send + 'static,
) -> Result<Option<T>, FidoError>
where
    T: Send + 'static,
    F: FnMut(Session, CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, FidoError>> + Send + 'static,
{
    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let sessions = wait_for_devices(cancel).await;
        if sessions.is_empty() {
            return Ok(None);
        }

        match run_round(sessions, cancel, &mut op, &mut on_invalid_count).await {
            RoundOutcome::Winner(value) => return Ok(Some(value)),
            RoundOutcome::Failure(e) => return Err(e),
            RoundOutcome::NoWinner if cancel.is_cancelled() => return Ok(None),
            RoundOutcome::NoWinner => {
                // No winner this round and nothing fatal: loop back to
                // step 1, picking up any newly plugged device.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{command, CID_BROADCAST, COMMAND_FLAG, HID_REPORT_SIZE};
    use crate::hid::device_io::mock::MockHidDevice;
    use crate::hid::report::build_frames;
    use std::collections::VecDeque;

    /// Echoes back a well-formed INIT response so a `Session` can be
    /// opened against an in-memory device without real hardware.
    struct EchoingInitDevice {
        inner: MockHidDevice,
        pending: VecDeque<[u8; HID_REPORT_SIZE]>,
        channel: u32,
    }

    impl HidDevice for EchoingInitDevice {
        fn write_report(&mut self, data: &[u8]) -> Result<usize, FidoError> {
            if data.len() >= 15 && data[4] == (command::INIT | COMMAND_FLAG) {
                let nonce = &data[7..15];
                let mut body = Vec::with_capacity(17);
                body.extend_from_slice(nonce);
                body.extend_from_slice(&self.channel.to_be_bytes());
                body.extend_from_slice(&[2, 1, 0, 0, 0]);
                for frame in build_frames(CID_BROADCAST, command::INIT, &body) {
                    self.pending.push_back(frame);
                }
            }
            self.inner.write_report(data)
        }

        fn read_report_timeout(
            &mut self,
            buf: &mut [u8],
            timeout_ms: i32,
        ) -> Result<usize, FidoError> {
            if let Some(frame) = self.pending.pop_front() {
                buf[..frame.len()].copy_from_slice(&frame);
                return Ok(frame.len());
            }
            self.inner.read_report_timeout(buf, timeout_ms)
        }

        fn vendor_id(&self) -> u16 {
            self.inner.vendor_id()
        }

        fn product_id(&self) -> u16 {
            self.inner.product_id()
        }
    }

    async fn mock_session(vendor_id: u16, product_id: u16, channel: u32) -> Session {
        let device = EchoingInitDevice {
            inner: MockHidDevice::new(vendor_id, product_id),
            pending: VecDeque::new(),
            channel,
        };
        Session::open(Box::new(device)).await.unwrap().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn run_round_returns_first_winner_and_cancels_the_rest() {
        let cancel = CancellationToken::new();
        let sessions = vec![
            mock_session(0x1111, 0xAAAA, 0xA001).await,
            mock_session(0x1111, 0xBBBB, 0xA002).await,
        ];

        let outcome: RoundOutcome<u16> = run_round(
            sessions,
            &cancel,
            &mut |session, task_cancel| {
                let product_id = session.product_id();
                async move {
                    if product_id == 0xAAAA {
                        Ok(product_id)
                    } else {
                        // Loses the race; must exit via its own
                        // cancellation token rather than running forever.
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(5)) => Ok(product_id),
                            _ = task_cancel.cancelled() => Err(FidoError::new(
                                ErrorKind::InterruptedIo,
                                "cancelled after a sibling task won",
                            )),
                        }
                    }
                }
            },
            &mut |_| {},
        )
        .await;

        match outcome {
            RoundOutcome::Winner(product_id) => assert_eq!(product_id, 0xAAAA),
            _ => panic!("expected a winner"),
        }
    }

    #[tokio::test]
    async fn run_round_counts_invalid_key_handles_and_reports_no_winner() {
        let cancel = CancellationToken::new();
        let sessions = vec![
            mock_session(0x2222, 0xCCCC, 0xB001).await,
            mock_session(0x2222, 0xDDDD, 0xB002).await,
        ];

        let mut last_count = 0u32;
        let outcome: RoundOutcome<()> = run_round(
            sessions,
            &cancel,
            &mut |_session, _task_cancel| async {
                Err(FidoError::new(ErrorKind::InvalidKeyHandle, "not this device"))
            },
            &mut |count| last_count = count,
        )
        .await;

        assert!(matches!(outcome, RoundOutcome::NoWinner));
        assert_eq!(last_count, 2);
    }
}
