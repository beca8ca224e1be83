//! Runtime configuration sourced from environment variables, plus the fixed
//! session policy constants. A missing or undersized signing secret is fatal
//! at startup; nothing in the request path reads the environment.

use std::time::Duration;

use crate::error::{Error, Result};

/// Well-known principal ids seeded when the user store initializes.
pub const SUPER_USER_ID: i64 = 1;
pub const GUEST_USER_ID: i64 = 2;

/// Minimum length of the HMAC signing secret, in bytes.
const MIN_SECRET_LEN: usize = 32;

/// Session lifetime and inactivity policy. These are policy values, not
/// tunables the request path should ever derive on the fly.
#[derive(Debug, Clone, Copy)]
pub struct SessionPolicy {
    /// Total lifetime of an access token.
    pub session_ttl: Duration,
    /// Trailing window before expiry in which a refresh mints a replacement token.
    pub refresh_window: Duration,
    /// Maximum client silence before a session/connection is expired.
    pub inactivity_budget: Duration,
    /// How long before forced close the expiry warning is pushed.
    pub warning_lead: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            // One half day. The user is more likely to see the sign-in page
            // at the start of the next work day instead of mid-work.
            session_ttl: Duration::from_secs(43_200),
            refresh_window: Duration::from_secs(3_600),
            inactivity_budget: Duration::from_secs(15 * 60),
            warning_lead: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    /// HMAC key for the token codec.
    pub secret: String,
    pub policy: SessionPolicy,
}

fn env_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

impl Config {
    /// Read configuration from `SENTRA_*` environment variables.
    ///
    /// `SENTRA_SECRET` is required and must be at least 32 bytes; everything
    /// else has defaults. Policy durations may be overridden with
    /// `SENTRA_SESSION_TTL_SECS`, `SENTRA_REFRESH_WINDOW_SECS`,
    /// `SENTRA_INACTIVITY_SECS` and `SENTRA_WARNING_LEAD_SECS`.
    pub fn from_env() -> Result<Self> {
        let http_port = std::env::var("SENTRA_HTTP_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(8787);

        let secret = std::env::var("SENTRA_SECRET")
            .map_err(|_| Error::config("SENTRA_SECRET must be set to the token signing secret"))?;
        if secret.len() < MIN_SECRET_LEN {
            return Err(Error::config(format!(
                "SENTRA_SECRET must be at least {MIN_SECRET_LEN} bytes"
            )));
        }

        let defaults = SessionPolicy::default();
        let policy = SessionPolicy {
            session_ttl: env_secs("SENTRA_SESSION_TTL_SECS", defaults.session_ttl),
            refresh_window: env_secs("SENTRA_REFRESH_WINDOW_SECS", defaults.refresh_window),
            inactivity_budget: env_secs("SENTRA_INACTIVITY_SECS", defaults.inactivity_budget),
            warning_lead: env_secs("SENTRA_WARNING_LEAD_SECS", defaults.warning_lead),
        };

        Ok(Self { http_port, secret, policy })
    }
}
