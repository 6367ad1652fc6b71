/* Token facade: APDU assembly, the U2F operation set (GetVersion,
 * Register, Authenticate, CheckKeyHandle), user-presence retry, and
 * base64/clientData plumbing (spec §4.2-§4.4). Everything here talks to
 * a `Session`; nothing here touches raw HID reports. */

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::clientdata;
use crate::constants::{apdu_status, authenticate_p1, instruction, U2F_VERSION};
use crate::error::{ErrorKind, FidoError};
use crate::hid::Session;
use crate::types::{
    AuthenticateResponse, RegisterResponse, StartedAuthentication, StartedRegistration,
};

const USER_PRESENCE_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(100);

/// Wraps a negotiated `Session` with the U2F operation set.
pub struct Token {
    session: Session,
}

fn build_apdu(ins: u8, p1: u8, p2: u8, data: &[u8]) -> Vec<u8> {
    let mut apdu = Vec::with_capacity(7 + data.len() + 2);
    apdu.push(0x00); // CLA
    apdu.push(ins);
    apdu.push(p1);
    apdu.push(p2);
    apdu.push(0x00); // extended-length marker
    apdu.push((data.len() >> 8) as u8);
    apdu.push(data.len() as u8);
    apdu.extend_from_slice(data);
    apdu.extend_from_slice(&[0x00, 0x00]); // Le
    apdu
}

/// Splits an APDU response into its status word and payload.
fn split_status(response: &[u8]) -> Result<(u16, &[u8]), FidoError> {
    if response.len() < 2 {
        return Err(FidoError::new(
            ErrorKind::ProtocolViolation,
            "APDU response shorter than the status word",
        ));
    }
    let split = response.len() - 2;
    let status = u16::from_be_bytes([response[split], response[split + 1]]);
    Ok((status, &response[..split]))
}

fn status_to_error(status: u16) -> FidoError {
    let kind = match status {
        apdu_status::USER_PRESENCE_REQUIRED => ErrorKind::UserPresenceRequired,
        apdu_status::INVALID_KEY_HANDLE => ErrorKind::InvalidKeyHandle,
        apdu_status::INVALID_PARAM_1_OR_2
        | apdu_status::CLASS_UNSUPPORTED
        | apdu_status::INSTRUCTION_UNSUPPORTED => ErrorKind::UnsupportedOperation,
        _ => ErrorKind::ProtocolViolation,
    };
    FidoError::with_status(kind, format!("device returned APDU status 0x{status:04X}"), status)
}

impl Token {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    /// Sends one APDU and classifies the response: `Ok(payload)` on
    /// `0x9000`, `Err` (tagged with the status word) otherwise.
    async fn call(&self, ins: u8, p1: u8, p2: u8, data: &[u8]) -> Result<Vec<u8>, FidoError> {
        let apdu = build_apdu(ins, p1, p2, data);
        let response = self.session.apdu(&apdu).await?;
        let (status, payload) = split_status(&response)?;
        if status == apdu_status::OK {
            Ok(payload.to_vec())
        } else {
            Err(status_to_error(status))
        }
    }

    /// `GetVersion`: legacy devices that don't understand the
    /// instruction report `"v0"` instead of erroring.
    pub async fn get_version(&self) -> Result<String, FidoError> {
        match self.call(instruction::VERSION, 0x00, 0x00, &[]).await {
            Ok(payload) => String::from_utf8(payload).map_err(|e| {
                FidoError::new(ErrorKind::ProtocolViolation, format!("non-ASCII version reply: {e}"))
            }),
            Err(e) if e.kind() == ErrorKind::UnsupportedOperation => {
                Ok(crate::constants::LEGACY_VERSION.to_string())
            }
            Err(e) => Err(e),
        }
    }

    /// Runs `attempt` until it stops returning `UserPresenceRequired`,
    /// sleeping `USER_PRESENCE_RETRY_DELAY` between tries and checking
    /// `cancel` at every wait (spec §4.4).
    async fn retry_on_user_presence<T, F, Fut>(
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<T, FidoError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, FidoError>>,
    {
        loop {
            match attempt().await {
                Err(e) if e.kind() == ErrorKind::UserPresenceRequired => {
                    debug!("user presence required, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(USER_PRESENCE_RETRY_DELAY) => {}
                        _ = cancel.cancelled() => {
                            return Err(FidoError::new(
                                ErrorKind::InterruptedIo,
                                "cancelled while waiting for user presence",
                            ));
                        }
                    }
                }
                other => return other,
            }
        }
    }

    /// `Register`: enrolls a new credential against `request.app_id`.
    pub async fn register(
        &self,
        request: &StartedRegistration,
        facet: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RegisterResponse, FidoError> {
        if request.version != U2F_VERSION {
            return Err(FidoError::new(
                ErrorKind::UnsupportedOperation,
                format!("unsupported protocol version {:?}", request.version),
            ));
        }

        let client_data = clientdata::build(clientdata::TYPE_REGISTER, &request.challenge, facet);
        let challenge_param = clientdata::hash(&client_data);
        let app_param = clientdata::hash(request.app_id.as_bytes());

        let mut data = Vec::with_capacity(64);
        data.extend_from_slice(&challenge_param);
        data.extend_from_slice(&app_param);

        let payload = Self::retry_on_user_presence(cancel, || {
            self.call(instruction::REGISTER, 0x00, 0x00, &data)
        })
        .await?;

        Ok(RegisterResponse {
            registration_data: BASE64.encode(payload),
            client_data: BASE64.encode(client_data),
        })
    }

    /// `Authenticate`: signs `request.challenge`/`request.app_id` with
    /// the credential behind `request.key_handle`.
    pub async fn authenticate(
        &self,
        request: &StartedAuthentication,
        enforce_user_presence: bool,
        facet: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<AuthenticateResponse, FidoError> {
        if request.version != U2F_VERSION {
            return Err(FidoError::new(
                ErrorKind::UnsupportedOperation,
                format!("unsupported protocol version {:?}", request.version),
            ));
        }

        let client_data =
            clientdata::build(clientdata::TYPE_AUTHENTICATE, &request.challenge, facet);
        let data = self.build_authenticate_message(request, &client_data)?;

        let p1 = if enforce_user_presence {
            authenticate_p1::ENFORCE_USER_PRESENCE
        } else {
            authenticate_p1::DONT_ENFORCE_USER_PRESENCE
        };

        // `status_to_error` already remaps InvalidParam1Or2 to
        // UnsupportedOperation for every P1 value, which covers the
        // P1=0x08 case spec'd out for devices that reject skip-presence
        // signing.
        let payload = Self::retry_on_user_presence(cancel, || {
            self.call(instruction::AUTHENTICATE, p1, 0x00, &data)
        })
        .await?;

        Ok(AuthenticateResponse {
            client_data: BASE64.encode(client_data),
            signature_data: BASE64.encode(payload),
            key_handle: request.key_handle.clone(),
        })
    }

    /// `CheckKeyHandle`: probes whether `request.key_handle` belongs to
    /// this device without performing a real authentication.
    pub async fn check_key_handle(
        &self,
        request: &StartedAuthentication,
    ) -> Result<bool, FidoError> {
        let client_data = clientdata::build(clientdata::TYPE_AUTHENTICATE, &request.challenge, None);
        let data = self.build_authenticate_message(request, &client_data)?;

        match self
            .call(instruction::AUTHENTICATE, authenticate_p1::CHECK_ONLY, 0x00, &data)
            .await
        {
            Err(e) if e.kind() == ErrorKind::UserPresenceRequired => Ok(true),
            Err(e) if e.kind() == ErrorKind::InvalidKeyHandle => Ok(false),
            Ok(_) => Err(FidoError::new(
                ErrorKind::ProtocolViolation,
                "device answered success to a check-only authenticate call",
            )),
            Err(e) => Err(e),
        }
    }

    fn build_authenticate_message(
        &self,
        request: &StartedAuthentication,
        client_data: &[u8],
    ) -> Result<Vec<u8>, FidoError> {
        let key_handle = BASE64.decode(&request.key_handle).map_err(|e| {
            FidoError::new(ErrorKind::ProtocolViolation, format!("malformed key handle: {e}"))
        })?;
        if key_handle.len() > 255 {
            return Err(FidoError::new(
                ErrorKind::ProtocolViolation,
                "key handle exceeds 255 bytes",
            ));
        }

        let challenge_param = clientdata::hash(client_data);
        let app_param = clientdata::hash(request.app_id.as_bytes());

        let mut data = Vec::with_capacity(65 + key_handle.len());
        data.extend_from_slice(&challenge_param);
        data.extend_from_slice(&app_param);
        data.push(key_handle.len() as u8);
        data.extend_from_slice(&key_handle);
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_apdu_matches_register_header_from_spec_example() {
        let data = vec![0u8; 64];
        let apdu = build_apdu(instruction::REGISTER, 0x00, 0x00, &data);
        assert_eq!(&apdu[..7], &[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x40]);
        assert_eq!(apdu.len(), 7 + 64 + 2);
        assert_eq!(&apdu[apdu.len() - 2..], &[0x00, 0x00]);
    }

    #[test]
    fn build_apdu_zero_length_data_still_carries_lc() {
        let apdu = build_apdu(instruction::VERSION, 0x00, 0x00, &[]);
        assert_eq!(&apdu[..7], &[0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn split_status_separates_payload_from_status_word() {
        let response = [0xDE, 0xAD, 0xBE, 0xEF, 0x90, 0x00];
        let (status, payload) = split_status(&response).unwrap();
        assert_eq!(status, apdu_status::OK);
        assert_eq!(payload, &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn status_to_error_maps_user_presence_required() {
        let err = status_to_error(apdu_status::USER_PRESENCE_REQUIRED);
        assert_eq!(err.kind(), ErrorKind::UserPresenceRequired);
        assert_eq!(err.apdu_status(), Some(apdu_status::USER_PRESENCE_REQUIRED));
    }
}
