//! # Webhook Signatures
//!
//! HMAC-SHA256 over the raw request body.
//!
//! | Platform   | Header                   | Encoding |
//! |------------|--------------------------|----------|
//! | storefront | `X-Shopify-Hmac-Sha256`  | base64   |
//! | warehouse  | `X-Warehouse-Signature`  | hex      |
//!
//! Verification goes through [`Mac::verify_slice`], which compares in
//! constant time.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn digest(secret: &[u8], body: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so this never takes the error branch.
    match <HmacSha256 as Mac>::new_from_slice(secret) {
        Ok(mut mac) => {
            mac.update(body);
            mac.finalize().into_bytes().to_vec()
        }
        Err(_) => Vec::new(),
    }
}

fn verify(secret: &[u8], body: &[u8], expected: &[u8]) -> bool {
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(expected).is_ok()
}

/// Base64 signature, as the storefront sends it.
pub fn sign_base64(secret: &[u8], body: &[u8]) -> String {
    BASE64.encode(digest(secret, body))
}

/// Hex signature, as the warehouse sends it.
pub fn sign_hex(secret: &[u8], body: &[u8]) -> String {
    hex::encode(digest(secret, body))
}

pub fn verify_base64(secret: &[u8], body: &[u8], signature: &str) -> bool {
    match BASE64.decode(signature.trim()) {
        Ok(expected) => verify(secret, body, &expected),
        Err(_) => false,
    }
}

pub fn verify_hex(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let signature = signature.trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    match hex::decode(signature) {
        Ok(expected) => verify(secret, body, &expected),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"whsec_test";
    const BODY: &[u8] = br#"{"id":1,"sku":"MUG-01"}"#;

    #[test]
    fn test_base64_signature() {
        let sig = sign_base64(SECRET, BODY);
        assert!(verify_base64(SECRET, BODY, &sig));
        assert!(!verify_base64(b"other", BODY, &sig));
        assert!(!verify_base64(SECRET, b"{}", &sig));
        assert!(!verify_base64(SECRET, BODY, "not base64!"));
    }

    #[test]
    fn test_hex_signature() {
        let sig = sign_hex(SECRET, BODY);
        assert_eq!(sig.len(), 64);
        assert!(verify_hex(SECRET, BODY, &sig));
        assert!(verify_hex(SECRET, BODY, &format!("sha256={sig}")));
        assert!(!verify_hex(SECRET, BODY, &sig[..62]));
        assert!(!verify_hex(SECRET, BODY, "zz"));
    }

    #[test]
    fn test_known_vector() {
        // RFC 4231 test case 2
        let sig = sign_hex(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }
}
