//! HMAC-SHA256 body signatures carried in the `HashSHA256` header.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header name shared by agent and server.
pub const SIGNATURE_HEADER: &str = "HashSHA256";

/// Hex-encoded HMAC-SHA256 of `body` keyed by `key`.
pub fn sign(key: &str, body: &[u8]) -> String {
    hex::encode(mac(key, body).finalize().into_bytes())
}

/// Constant-time comparison of `signature_hex` against the expected MAC.
/// A signature that is not valid hex never verifies.
pub fn verify(key: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    mac(key, body).verify_slice(&signature).is_ok()
}

fn mac(key: &str, body: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any size"));
    mac.update(body);
    mac
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trips_with_same_key() {
        let body = br#"{"id":"PollCount","type":"counter","delta":1}"#;
        let sig = sign("secret", body);
        assert_eq!(sig.len(), 64);
        assert!(verify("secret", body, &sig));
    }

    #[test]
    fn different_key_or_body_fails() {
        let sig = sign("secret", b"payload");
        assert!(!verify("other", b"payload", &sig));
        assert!(!verify("secret", b"payload!", &sig));
    }

    #[test]
    fn garbage_header_fails() {
        assert!(!verify("secret", b"payload", "not-hex"));
        assert!(!verify("secret", b"payload", ""));
    }
}
