/* Request/response DTOs for the token facade (spec §3). These mirror
 * the JSON shapes a caller typically has sitting around from a server
 * round trip; this crate only consumes/produces them, it never talks to
 * a server. */

/// Parameters needed to start a registration ceremony.
#[derive(Debug, Clone)]
pub struct StartedRegistration {
    pub app_id: String,
    pub challenge: String,
    pub version: String,
}

/// Parameters needed to start an authentication ceremony against one
/// previously registered credential.
#[derive(Debug, Clone)]
pub struct StartedAuthentication {
    pub app_id: String,
    pub challenge: String,
    /// Base64-encoded key handle, as returned by `RegisterResponse`.
    pub key_handle: String,
    pub version: String,
}

/// Result of a successful `Register` call, base64-encoded per spec §3.
#[derive(Debug, Clone)]
pub struct RegisterResponse {
    pub registration_data: String,
    pub client_data: String,
}

/// Result of a successful `Authenticate` call, base64-encoded per spec §3.
#[derive(Debug, Clone)]
pub struct AuthenticateResponse {
    pub client_data: String,
    pub signature_data: String,
    pub key_handle: String,
}
