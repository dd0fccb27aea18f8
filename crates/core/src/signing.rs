use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Sign a JSON payload with HMAC-SHA256, hex-encoded.
///
/// The MAC covers the serialized payload exactly as it would appear on the
/// wire. HMAC-SHA256 accepts any key length, so construction cannot fail.
pub fn sign_payload(secret: &str, payload: &serde_json::Value) -> String {
    let body = payload.to_string();
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC-SHA256 accepts any key length");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison of a received signature against the expected one.
pub fn verify_signature(secret: &str, payload: &serde_json::Value, signature: &str) -> bool {
    let expected = sign_payload(secret, payload);
    subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature.as_bytes()).into()
}
