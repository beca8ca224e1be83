//! Session authority: issuance, verification, sliding refresh, sign-out and
//! MFA challenge state.
//!
//! All session state lives in memory behind `parking_lot` locks: a session
//! table keyed by token id and an activity table keyed by user id. Collaborators
//! (credential store, token codec) are injected at construction; tests pass
//! fakes satisfying the same traits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::config::SessionPolicy;
use crate::error::{Error, Result};
use crate::registry::SessionInvalidator;
use crate::security;
use crate::token::{Claims, TokenCodec};
use crate::tprintln;

use super::principal::Principal;
use super::users::{User, UserId, UserStore};

/// Server-side record of one issued access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token_id: String,
    pub access_token: String,
    pub claims: Claims,
}

#[derive(Debug, Clone, Copy)]
struct ActivityState {
    last_seen: Instant,
    passed_mfa_challenge: bool,
}

pub struct SessionAuthority {
    codec: TokenCodec,
    users: Arc<dyn UserStore>,
    policy: SessionPolicy,
    /// Token id -> issued session.
    sessions: RwLock<HashMap<String, Session>>,
    /// User id -> inactivity/MFA state.
    activity: RwLock<HashMap<UserId, ActivityState>>,
    /// User id -> staged (not yet enabled) TOTP secret.
    staged_mfa: RwLock<HashMap<UserId, String>>,
}

impl SessionAuthority {
    pub fn new(codec: TokenCodec, users: Arc<dyn UserStore>, policy: SessionPolicy) -> Self {
        Self {
            codec,
            users,
            policy,
            sessions: RwLock::new(HashMap::new()),
            activity: RwLock::new(HashMap::new()),
            staged_mfa: RwLock::new(HashMap::new()),
        }
    }

    /// Sign in with email and password.
    ///
    /// When the account has MFA enabled the returned principal carries a
    /// pending-challenge marker; `verify_mfa` must succeed before routes that
    /// verify the challenge will accept the token.
    pub fn sign_in(&self, email: &str, password: &str) -> Result<(Principal, Session)> {
        let user = self.verify_credentials(email, password)?;
        let session = self.mint_session(&user, true)?;
        let pending = user.mfa_enabled;
        let principal = Principal {
            user,
            session: session.clone(),
            peer: None,
            mfa_challenge_pending: pending,
        };
        Ok((principal, session))
    }

    /// Check email and password without creating a session.
    pub fn verify_credentials(&self, email: &str, password: &str) -> Result<User> {
        let email = email.trim();
        if email.is_empty() {
            return Err(Error::required("email"));
        }
        if password.is_empty() {
            return Err(Error::required("password"));
        }

        let user = self
            .users
            .find_by_email(email)
            .ok_or(Error::InvalidCredentials)?;
        if !security::verify_password(&user.password_hash, password) {
            return Err(Error::InvalidCredentials);
        }
        if !user.verified {
            return Err(Error::UserIsNotVerified);
        }
        if !user.enabled {
            // Disabled reads the same as unknown on purpose.
            return Err(Error::UserNotFound);
        }
        Ok(user)
    }

    /// Verify an access token.
    ///
    /// With `refresh`, activity slides and — inside the trailing refresh
    /// window — a replacement token is minted for the same subject and
    /// returned in the principal's session. The prior token stays honorable
    /// until its own expiry; refresh is additive, not destructive.
    ///
    /// With `verify_mfa_challenge`, an account that owes an MFA code fails
    /// with `MfaChallengeRequired` rather than `InvalidToken`.
    pub fn verify_access_token(
        &self,
        token: &str,
        refresh: bool,
        verify_mfa_challenge: bool,
    ) -> Result<Principal> {
        let claims = self.codec.verify(token)?;
        let user_id: UserId = claims.sub.parse().map_err(|_| Error::InvalidToken)?;

        let now = Utc::now().timestamp();
        if now >= claims.exp {
            // Prune the dead record while here. Expired is expired; the
            // refresh window is strictly pre-expiry.
            self.sessions.write().remove(&claims.id);
            return Err(Error::InvalidToken);
        }

        let mut session = self
            .sessions
            .read()
            .get(&claims.id)
            .cloned()
            .ok_or(Error::InvalidToken)?;

        let (last_seen, passed) = {
            let activity = self.activity.read();
            let state = activity.get(&user_id).ok_or(Error::InvalidToken)?;
            (state.last_seen, state.passed_mfa_challenge)
        };
        if last_seen.elapsed() > self.policy.inactivity_budget {
            return Err(Error::SessionExpired);
        }

        let user = self.users.find_by_id(user_id).ok_or(Error::UserNotFound)?;

        if verify_mfa_challenge && user.mfa_enabled && !passed {
            return Err(Error::MfaChallengeRequired);
        }

        if refresh {
            self.record_activity(user_id);
            let remaining = claims.exp - now;
            if remaining <= self.policy.refresh_window.as_secs() as i64 {
                session = self.mint_session(&user, false)?;
                tprintln!(
                    "session.refresh user={} token_id={}",
                    user_id,
                    session.token_id
                );
            }
        }

        let pending = user.mfa_enabled && !passed;
        Ok(Principal { user, session, peer: None, mfa_challenge_pending: pending })
    }

    /// Sign the principal's current session out. Idempotent.
    pub fn sign_out(&self, principal: &Principal) {
        if self
            .sessions
            .write()
            .remove(&principal.session.token_id)
            .is_none()
        {
            warn!("attempting to sign out of a session that does not exist");
        }
        self.activity.write().remove(&principal.user.id);
        tprintln!("session.sign_out user={}", principal.user.id);
    }

    /// Invalidate every session a user holds. Used by the connection registry
    /// when an inactivity timeout forces a sign-out; never fails.
    pub fn sign_out_user(&self, user_id: UserId) {
        let sub = user_id.to_string();
        self.sessions.write().retain(|_, s| s.claims.sub != sub);
        self.activity.write().remove(&user_id);
        tprintln!("session.sign_out_user user={}", user_id);
    }

    /// Slide the inactivity window for a user. No-op without a live session.
    pub fn record_activity(&self, user_id: UserId) {
        if let Some(state) = self.activity.write().get_mut(&user_id) {
            state.last_seen = Instant::now();
        }
    }

    /// Begin MFA registration: stage a fresh TOTP secret and hand back the
    /// provisioning URL. MFA is NOT enabled yet — the user must prove
    /// possession via `register_mfa` first, and the secret can be regenerated
    /// until then.
    pub fn generate_totp_secret(&self, principal: &Principal) -> Result<(String, String)> {
        let secret = security::generate_totp_secret()?;
        self.staged_mfa
            .write()
            .insert(principal.user.id, secret.clone());
        let url = security::otpauth_url(&principal.user.email, &secret);
        Ok((secret, url))
    }

    /// Complete MFA registration by validating one code against the staged
    /// secret. On success the account has MFA enabled and the stage is
    /// discarded.
    pub fn register_mfa(&self, principal: &Principal, code: Option<&str>) -> Result<User> {
        let code = trimmed(code).ok_or_else(|| Error::required("mfa_code"))?;
        // A missing stage and a wrong code are the same failure on purpose.
        let staged = self.staged_mfa.read().get(&principal.user.id).cloned();
        let Some(secret) = staged else {
            return Err(Error::InvalidMfaCode);
        };
        if !security::verify_totp(&secret, code, unix_now()) {
            return Err(Error::InvalidMfaCode);
        }

        self.staged_mfa.write().remove(&principal.user.id);
        let mut user = principal.user.clone();
        user.mfa_enabled = true;
        user.totp_secret = Some(secret);
        self.users.update(&user).map_err(Error::from)?;
        tprintln!("mfa.registered user={}", user.id);
        Ok(user)
    }

    /// Complete the sign-in MFA challenge for this session.
    pub fn verify_mfa(&self, principal: &Principal, code: Option<&str>) -> Result<()> {
        let code = trimmed(code).ok_or_else(|| Error::required("mfa_code"))?;
        let user = &principal.user;
        if !user.mfa_enabled {
            return Err(Error::MfaNotEnabled);
        }
        let Some(secret) = user.totp_secret.as_deref() else {
            return Err(Error::MfaNotEnabled);
        };
        if !security::verify_totp(secret, code, unix_now()) {
            return Err(Error::InvalidMfaCode);
        }

        let mut activity = self.activity.write();
        match activity.get_mut(&user.id) {
            Some(state) => {
                state.passed_mfa_challenge = true;
                Ok(())
            }
            // No live challenge state; indistinguishable from a bad code.
            None => Err(Error::InvalidMfaCode),
        }
    }

    /// Mint a session for a user. With `supersede`, prior sessions for the
    /// identity are dropped and activity state resets (fresh sign-in); without
    /// it the new session coexists with the old until the old token expires
    /// (transparent refresh).
    fn mint_session(&self, user: &User, supersede: bool) -> Result<Session> {
        let mut token_id = Uuid::new_v4().to_string();
        let mut exists = true;
        for i in 0..3 {
            if !self.sessions.read().contains_key(&token_id) {
                exists = false;
                break;
            }
            warn!("token id collision on attempt ({i}) using id ({token_id})");
            token_id = Uuid::new_v4().to_string();
        }
        if exists {
            return Err(Error::internal("failed to allocate a unique token id"));
        }

        let now = Utc::now().timestamp();
        let claims = Claims {
            id: token_id.clone(),
            sub: user.id.to_string(),
            iat: now,
            exp: now + self.policy.session_ttl.as_secs() as i64,
        };
        let access_token = self.codec.sign(&claims);
        let session = Session { token_id: token_id.clone(), access_token, claims };

        {
            let mut sessions = self.sessions.write();
            if supersede {
                sessions.retain(|_, s| s.claims.sub != session.claims.sub);
            }
            sessions.insert(token_id.clone(), session.clone());
        }
        if supersede {
            self.activity.write().insert(
                user.id,
                ActivityState {
                    last_seen: Instant::now(),
                    passed_mfa_challenge: !user.mfa_enabled,
                },
            );
        }
        tprintln!("session.issue user={} token_id={}", user.id, token_id);
        Ok(session)
    }
}

impl SessionInvalidator for SessionAuthority {
    fn invalidate(&self, user_id: UserId) {
        self.sign_out_user(user_id);
    }
}

fn trimmed(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn unix_now() -> u64 {
    Utc::now().timestamp().max(0) as u64
}
