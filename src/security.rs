//! Password hashing and TOTP second-factor primitives.
//!
//! Argon2id PHC strings for passwords; RFC 6238 TOTP (HMAC-SHA1, 6 digits,
//! 30 second step) for the second factor. Nothing here touches storage or
//! session state — the session authority composes these.

use anyhow::{anyhow, Result};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use password_hash::{PasswordHash, SaltString};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

pub const OTP_DIGITS: u32 = 6;
pub const OTP_STEP_SECS: u64 = 30;
/// Steps of clock drift tolerated on either side when checking a code.
const OTP_DRIFT_STEPS: u64 = 1;

pub fn hash_password(password: &str) -> Result<String> {
    let mut salt_bytes = [0u8; 16];
    getrandom::getrandom(&mut salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let argon2 = Argon2::default();
    let phc = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!(e.to_string()))?
        .to_string();
    Ok(phc)
}

pub fn verify_password(hash: &str, password: &str) -> bool {
    if let Ok(parsed) = PasswordHash::new(hash) {
        let argon2 = Argon2::default();
        argon2.verify_password(password.as_bytes(), &parsed).is_ok()
    } else {
        false
    }
}

/// Generate a fresh 20-byte TOTP secret, base64url encoded.
pub fn generate_totp_secret() -> Result<String> {
    let mut bytes = [0u8; 20];
    getrandom::getrandom(&mut bytes).map_err(|e| anyhow!(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Provisioning URL handed to the client when MFA registration begins.
pub fn otpauth_url(email: &str, secret: &str) -> String {
    format!("otpauth://totp/Sentra:{email}?secret={secret}")
}

fn hotp(secret: &[u8], counter: u64) -> u32 {
    let mut mac = HmacSha1::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    // Dynamic truncation per RFC 4226 §5.3.
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let bin = ((digest[offset] & 0x7f) as u32) << 24
        | (digest[offset + 1] as u32) << 16
        | (digest[offset + 2] as u32) << 8
        | (digest[offset + 3] as u32);
    bin % 10u32.pow(OTP_DIGITS)
}

/// The code for a given secret at a given unix time.
pub fn totp_code(secret: &str, unix_time: u64) -> Result<String> {
    let key = URL_SAFE_NO_PAD
        .decode(secret)
        .map_err(|_| anyhow!("TOTP secret is not valid base64"))?;
    let counter = unix_time / OTP_STEP_SECS;
    Ok(format!("{:06}", hotp(&key, counter)))
}

/// Check a submitted code against the secret, tolerating one step of drift
/// on either side.
pub fn verify_totp(secret: &str, code: &str, unix_time: u64) -> bool {
    let Ok(key) = URL_SAFE_NO_PAD.decode(secret) else {
        return false;
    };
    let counter = unix_time / OTP_STEP_SECS;
    let lo = counter.saturating_sub(OTP_DRIFT_STEPS);
    let hi = counter + OTP_DRIFT_STEPS;
    (lo..=hi).any(|c| format!("{:06}", hotp(&key, c)) == code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_round_trip() {
        let phc = hash_password("Password1!").unwrap();
        assert!(verify_password(&phc, "Password1!"));
        assert!(!verify_password(&phc, "password1!"));
        assert!(!verify_password("not-a-phc-string", "Password1!"));
    }

    #[test]
    fn hashes_are_salted() {
        let a = hash_password("Password1!").unwrap();
        let b = hash_password("Password1!").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn totp_accepts_adjacent_steps_only() {
        let secret = generate_totp_secret().unwrap();
        let now = 1_700_000_000u64;
        let code = totp_code(&secret, now).unwrap();
        assert_eq!(code.len(), 6);

        assert!(verify_totp(&secret, &code, now));
        assert!(verify_totp(&secret, &code, now + OTP_STEP_SECS));
        assert!(verify_totp(&secret, &code, now - OTP_STEP_SECS));
        // Two steps out is rejected.
        assert!(!verify_totp(&secret, &code, now + 3 * OTP_STEP_SECS));
        assert!(!verify_totp(&secret, &code, now - 3 * OTP_STEP_SECS));
    }

    #[test]
    fn totp_rejects_wrong_code_and_bad_secret() {
        let secret = generate_totp_secret().unwrap();
        assert!(!verify_totp(&secret, "000000", 1_700_000_000));
        assert!(!verify_totp("%%%not-base64%%%", "123456", 1_700_000_000));
    }

    #[test]
    fn rfc6238_sha1_vector() {
        // RFC 6238 appendix B, ASCII secret "12345678901234567890", T=59s.
        let secret = URL_SAFE_NO_PAD.encode(b"12345678901234567890");
        let code = totp_code(&secret, 59).unwrap();
        // The appendix lists 94287082 for 8 digits; the low 6 are 287082.
        assert_eq!(code, "287082");
    }
}
