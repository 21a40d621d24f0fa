//! Name-bound authenticated cookie encoding.
//!
//! The cookie value carries the sandbox id under an HMAC-SHA256 tag keyed
//! by a server-side secret. The cookie name is mixed into the MAC, so a
//! value minted under one name never decodes under another. There is no key
//! rotation; changing the secret invalidates outstanding cookies.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum CookieError {
    #[error("malformed cookie value")]
    Malformed,
    #[error("cookie payload is not valid UTF-8")]
    Encoding,
    #[error("cookie signature mismatch")]
    BadSignature,
}

/// Authenticated encoder/decoder for the per-sandbox session cookie.
#[derive(Clone)]
pub struct CookieCodec {
    key: Vec<u8>,
}

impl CookieCodec {
    pub fn new(secret: &str) -> Self {
        Self {
            key: secret.as_bytes().to_vec(),
        }
    }

    fn mac(&self, name: &str, value: &[u8]) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts keys of any length");
        mac.update(name.as_bytes());
        mac.update(&[0u8]);
        mac.update(value);
        mac
    }

    /// Encode a plaintext value for the given cookie name.
    pub fn encode(&self, name: &str, value: &str) -> String {
        let tag = self.mac(name, value.as_bytes()).finalize().into_bytes();
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(value.as_bytes()),
            URL_SAFE_NO_PAD.encode(tag)
        )
    }

    /// Decode and verify a cookie value minted for the given name.
    pub fn decode(&self, name: &str, encoded: &str) -> Result<String, CookieError> {
        let (value_b64, tag_b64) = encoded.split_once('.').ok_or(CookieError::Malformed)?;
        let value = URL_SAFE_NO_PAD
            .decode(value_b64)
            .map_err(|_| CookieError::Malformed)?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag_b64)
            .map_err(|_| CookieError::Malformed)?;
        self.mac(name, &value)
            .verify_slice(&tag)
            .map_err(|_| CookieError::BadSignature)?;
        String::from_utf8(value).map_err(|_| CookieError::Encoding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> CookieCodec {
        CookieCodec::new("test-secret")
    }

    #[test]
    fn round_trip() {
        let encoded = codec().encode("auth-sb-1", "sb-1");
        assert_eq!(codec().decode("auth-sb-1", &encoded).unwrap(), "sb-1");
    }

    #[test]
    fn name_binding() {
        let encoded = codec().encode("b", "sb-1");
        assert!(matches!(
            codec().decode("a", &encoded),
            Err(CookieError::BadSignature)
        ));
    }

    #[test]
    fn tampered_value_is_rejected() {
        let encoded = codec().encode("auth-sb-1", "sb-1");
        let (_, tag) = encoded.split_once('.').unwrap();
        let forged = format!("{}.{}", URL_SAFE_NO_PAD.encode("sb-2"), tag);
        assert!(codec().decode("auth-sb-1", &forged).is_err());
    }

    #[test]
    fn tampered_tag_is_rejected() {
        let encoded = codec().encode("auth-sb-1", "sb-1");
        let mut forged: String = encoded.clone();
        let flipped = if forged.ends_with('A') { 'B' } else { 'A' };
        forged.pop();
        forged.push(flipped);
        assert!(codec().decode("auth-sb-1", &forged).is_err());
    }

    #[test]
    fn different_secret_is_rejected() {
        let encoded = codec().encode("auth-sb-1", "sb-1");
        let other = CookieCodec::new("other-secret");
        assert!(matches!(
            other.decode("auth-sb-1", &encoded),
            Err(CookieError::BadSignature)
        ));
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(matches!(
            codec().decode("auth-sb-1", "no-dot-here"),
            Err(CookieError::Malformed)
        ));
        assert!(matches!(
            codec().decode("auth-sb-1", "!!!.!!!"),
            Err(CookieError::Malformed)
        ));
    }
}
