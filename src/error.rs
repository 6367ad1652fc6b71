/* Error taxonomy for the transport, facade, and discovery layers.
 *
 * A single `FidoError` is surfaced to callers everywhere in this crate,
 * tagged with an `ErrorKind`. Internal helpers propagate it with `?`;
 * the retry loops in `token` and `discovery` match on `kind()` to decide
 * what to swallow and what to let through, instead of matching on a
 * family of ad-hoc exception types. */

/* Tag attached to every FidoError. Retry/propagation logic matches on
 * this instead of string-matching messages.
 *
 * UserPresenceRequired: device wants a touch; consumed internally by the
 * register/authenticate retry loop.
 * InvalidKeyHandle: key handle does not belong to this device.
 * UnsupportedOperation: device rejected an instruction/parameter, or the
 * caller asked for a capability the device's bits say it lacks.
 * Timeout: device signalled MessageTimeout, or a timer fired.
 * TokenBusy: device signalled ChannelBusy, or is mid-lock.
 * InterruptedIo: OS read/write failed or timed out at the HID layer.
 * ProtocolViolation: frame too short, wrong channel, wrong command echo,
 * out-of-order sequence, unexpected success on a check-only call, or any
 * other invariant breach.
 * NoDevice: no FIDO device is currently present. Internal to Open and the
 * discovery layer; never escapes a successful Open. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserPresenceRequired,
    InvalidKeyHandle,
    UnsupportedOperation,
    Timeout,
    TokenBusy,
    InterruptedIo,
    ProtocolViolation,
    NoDevice,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

// The error type returned by every fallible operation in this crate.
#[derive(Debug)]
pub struct FidoError {
    kind: ErrorKind,
    message: String,
    // originating APDU status word, when the error came from a decoded
    // APDU response, for diagnostics.
    apdu_status: Option<u16>,
}

impl FidoError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            apdu_status: None,
        }
    }

    pub fn with_status(kind: ErrorKind, message: impl Into<String>, status: u16) -> Self {
        Self {
            kind,
            message: message.into(),
            apdu_status: Some(status),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn apdu_status(&self) -> Option<u16> {
        self.apdu_status
    }

    // true for the failure modes the discovery layer's retry loops
    // swallow as transient.
    pub fn is_transient_discovery_failure(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Timeout | ErrorKind::TokenBusy | ErrorKind::InterruptedIo
        )
    }
}

impl std::fmt::Display for FidoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(status) = self.apdu_status {
            write!(f, " (apdu status 0x{status:04X})")?;
        }
        Ok(())
    }
}

impl std::error::Error for FidoError {}

pub type Result<T> = std::result::Result<T, FidoError>;
