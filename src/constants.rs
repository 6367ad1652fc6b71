/* U2FHID command bytes, device error codes, APDU status words, and U2F
 * instruction codes. All values are from the FIDO U2F HID protocol
 * specification; see spec.md §6 for the authoritative table this
 * mirrors. */

/// HID report size in bytes, fixed by the U2FHID protocol.
pub const HID_REPORT_SIZE: usize = 64;

/// The FIDO usage page, used to filter HID devices during enumeration.
pub const HID_USAGE_PAGE_FIDO: u16 = 0xF1D0;
/// The FIDO usage, used alongside the usage page to filter HID devices.
pub const HID_USAGE_FIDO: u16 = 0x01;

/// Broadcast channel id, used only to carry the INIT handshake.
pub const CID_BROADCAST: u32 = 0xFFFFFFFF;

/// Command flag bit (`0x80`) that marks a frame as an initial frame.
pub const COMMAND_FLAG: u8 = 0x80;

/// U2FHID command bytes (low 7 bits; `COMMAND_FLAG` is OR'd in on the wire).
pub mod command {
    pub const PING: u8 = 0x01;
    pub const APDU: u8 = 0x03;
    pub const LOCK: u8 = 0x04;
    pub const INIT: u8 = 0x06;
    pub const WINK: u8 = 0x08;
    pub const ERROR: u8 = 0x3F;
}

/// Device error codes carried in byte 7 of an ERROR frame's payload.
pub mod device_error {
    pub const INVALID_CMD: u8 = 0x01;
    pub const INVALID_PARAMETER: u8 = 0x02;
    pub const INVALID_MESSAGE_LENGTH: u8 = 0x03;
    pub const INVALID_SEQUENCE_VALUE: u8 = 0x04;
    pub const MESSAGE_TIMEOUT: u8 = 0x05;
    pub const CHANNEL_BUSY: u8 = 0x06;
}

/// APDU status words (last two bytes of a response, big-endian).
pub mod apdu_status {
    pub const OK: u16 = 0x9000;
    pub const USER_PRESENCE_REQUIRED: u16 = 0x6985;
    pub const INVALID_KEY_HANDLE: u16 = 0x6A80;
    pub const INVALID_PARAM_1_OR_2: u16 = 0x6A86;
    pub const INVALID_LENGTH: u16 = 0x6700;
    pub const CLASS_UNSUPPORTED: u16 = 0x6E00;
    pub const INSTRUCTION_UNSUPPORTED: u16 = 0x6D00;
}

/// U2F instruction codes (APDU `INS` byte).
pub mod instruction {
    pub const REGISTER: u8 = 0x01;
    pub const AUTHENTICATE: u8 = 0x02;
    pub const VERSION: u8 = 0x03;
}

/// Authenticate `P1` parameter values.
pub mod authenticate_p1 {
    pub const CHECK_ONLY: u8 = 0x07;
    pub const ENFORCE_USER_PRESENCE: u8 = 0x03;
    pub const DONT_ENFORCE_USER_PRESENCE: u8 = 0x08;
}

/// Session capability bits (§3).
pub mod capability {
    pub const WINK: u8 = 0x01;
    pub const LOCK: u8 = 0x02;
}

/// The only U2F protocol version this library supports.
pub const U2F_VERSION: &str = "U2F_V2";

/// Value `GetVersion` returns when the device answers
/// `InstructionUnsupported` (legacy devices, spec §4.3).
pub const LEGACY_VERSION: &str = "v0";
