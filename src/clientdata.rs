/* Builds the `clientData` JSON object U2F wraps around a server
 * challenge (spec §3/§6). The library only assembles and hashes it; it
 * never talks to a server or generates a challenge itself. */

use serde_json::json;
use sha2::{Digest, Sha256};

/// `typ` values for the two operations that carry client data.
pub const TYPE_REGISTER: &str = "navigator.id.finishEnrollment";
pub const TYPE_AUTHENTICATE: &str = "navigator.id.getAssertion";

/// Build the `clientData` JSON object as raw bytes, ready to be hashed
/// and also returned to the caller verbatim (spec §3's `clientData`
/// field is the JSON itself, not its hash). `origin` of `None` serializes
/// as the JSON literal `null`, not the string `"null"`.
pub fn build(typ: &str, challenge: &str, origin: Option<&str>) -> Vec<u8> {
    let origin = match origin {
        Some(o) => serde_json::Value::String(o.to_string()),
        None => serde_json::Value::Null,
    };
    let value = json!({
        "typ": typ,
        "challenge": challenge,
        "origin": origin,
    });
    serde_json::to_vec(&value).expect("clientData JSON is always serializable")
}

/// SHA-256 of the raw `clientData` bytes, as fed into Register/Authenticate.
pub fn hash(client_data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(client_data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_produces_valid_json_with_expected_fields() {
        let bytes = build(TYPE_REGISTER, "abc123", Some("https://example.com"));
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["typ"], TYPE_REGISTER);
        assert_eq!(value["challenge"], "abc123");
        assert_eq!(value["origin"], "https://example.com");
    }

    #[test]
    fn build_with_no_facet_serializes_origin_as_json_null() {
        let bytes = build(TYPE_REGISTER, "test", None);
        assert_eq!(
            bytes,
            br#"{"challenge":"test","origin":null,"typ":"navigator.id.finishEnrollment"}"#
        );
    }

    #[test]
    fn hash_is_deterministic_and_32_bytes() {
        let bytes = build(TYPE_AUTHENTICATE, "xyz", Some("https://example.com"));
        let h1 = hash(&bytes);
        let h2 = hash(&bytes);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 32);
    }
}
