//! Compact signed-claim codec.
//!
//! Tokens are standard HS256 JWTs: `base64url(header).base64url(claims).base64url(mac)`.
//! The codec owns signing and signature verification only. It never checks
//! expiry — that policy belongs to the session authority, which must be able
//! to inspect an expired-but-authentic claim set when deciding refresh
//! behavior.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const HEADER: &[u8] = br#"{"alg":"HS256","typ":"JWT"}"#;

/// Claim set carried by every access token.
/// Field names are the wire names: `id` is the token id, `sub` the user id,
/// `iat`/`exp` are unix timestamps in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub id: String,
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("token signature does not match")]
    InvalidSignature,
    #[error("token is malformed")]
    Malformed,
}

#[derive(Clone)]
pub struct TokenCodec {
    key: Vec<u8>,
}

impl TokenCodec {
    pub fn new(secret: &[u8]) -> Self {
        Self { key: secret.to_vec() }
    }

    /// Deterministically serialize and sign a claim set. No side effects.
    pub fn sign(&self, claims: &Claims) -> String {
        let header = URL_SAFE_NO_PAD.encode(HEADER);
        // Claims is a plain struct of strings and integers; serialization cannot fail.
        let body = serde_json::to_vec(claims).expect("claims serialize");
        let payload = URL_SAFE_NO_PAD.encode(body);
        let input = format!("{header}.{payload}");
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(input.as_bytes());
        let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{input}.{sig}")
    }

    /// Verify a token's signature and structure, returning its claims.
    ///
    /// Fails with `InvalidSignature` when the MAC does not match and
    /// `Malformed` when the token cannot be parsed at all.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(sig), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed);
        };

        let sig_bytes = URL_SAFE_NO_PAD.decode(sig).map_err(|_| TokenError::Malformed)?;
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        mac.verify_slice(&sig_bytes)
            .map_err(|_| TokenError::InvalidSignature)?;

        let body = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| TokenError::Malformed)?;
        serde_json::from_slice(&body).map_err(|_| TokenError::Malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> TokenCodec {
        TokenCodec::new(b"unit-test-secret-key-at-least-32-bytes")
    }

    fn claims() -> Claims {
        Claims {
            id: "tok-1".into(),
            sub: "42".into(),
            iat: 1_700_000_000,
            exp: 1_700_043_200,
        }
    }

    #[test]
    fn round_trip() {
        let c = codec();
        let signed = c.sign(&claims());
        assert_eq!(c.verify(&signed).unwrap(), claims());
    }

    #[test]
    fn wrong_key_is_invalid_signature() {
        let signed = codec().sign(&claims());
        let other = TokenCodec::new(b"a-different-secret-key-of-enough-len");
        assert_eq!(other.verify(&signed), Err(TokenError::InvalidSignature));
    }

    #[test]
    fn tampered_payload_is_invalid_signature() {
        let c = codec();
        let signed = c.sign(&claims());
        let mut parts: Vec<&str> = signed.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&Claims { sub: "1".into(), ..claims() }).unwrap(),
        );
        parts[1] = &forged;
        let tampered = parts.join(".");
        assert_eq!(c.verify(&tampered), Err(TokenError::InvalidSignature));
    }

    #[test]
    fn garbage_is_malformed() {
        let c = codec();
        assert_eq!(c.verify("not-a-token"), Err(TokenError::Malformed));
        assert_eq!(c.verify("a.b"), Err(TokenError::Malformed));
        assert_eq!(c.verify("a.b.c.d"), Err(TokenError::Malformed));
        assert_eq!(c.verify(""), Err(TokenError::Malformed));
    }

    #[test]
    fn expiry_is_not_checked_here() {
        // A long-expired claim set still round-trips; expiry is the
        // session authority's call.
        let c = codec();
        let expired = Claims { iat: 1_000, exp: 2_000, ..claims() };
        let signed = c.sign(&expired);
        assert_eq!(c.verify(&signed).unwrap(), expired);
    }
}
