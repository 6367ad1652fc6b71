//! Host-side FIDO U2F library: USB-HID transport, channel negotiation,
//! and the `Register`/`Authenticate`/`CheckKeyHandle`/`GetVersion`
//! operation set, plus multi-device discovery and parallel dispatch.
//!
//! Server-side attestation/signature verification, JSON serialization
//! beyond `clientData`, and the SHA-256 primitive itself are treated as
//! external collaborators this crate calls into (`serde_json`, `sha2`),
//! not reimplemented here.

pub mod buffer;
pub mod clientdata;
pub mod constants;
pub mod device_db;
pub mod discovery;
pub mod error;
pub mod hid;
pub mod token;
pub mod types;

pub use error::{ErrorKind, FidoError, Result};
pub use hid::Session;
pub use token::Token;
