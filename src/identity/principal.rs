use chrono::Utc;

use crate::config::{GUEST_USER_ID, SUPER_USER_ID};
use crate::token::Claims;

use super::session::Session;
use super::users::{User, UserId};

/// The authenticated identity attached to one request or one connection.
/// Built on every successful verification; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user: User,
    pub session: Session,
    /// Network peer address of the current request, when known.
    pub peer: Option<String>,
    /// True while the account owes an MFA code before privileged access.
    pub mfa_challenge_pending: bool,
}

impl Principal {
    pub fn is_super_user(&self) -> bool {
        self.user.id == SUPER_USER_ID
    }

    pub fn is_guest(&self) -> bool {
        self.user.id == GUEST_USER_ID
    }

    pub fn enabled(&self) -> bool {
        self.user.enabled
    }

    pub fn verified(&self) -> bool {
        self.user.verified
    }

    pub fn with_peer(mut self, peer: Option<String>) -> Self {
        self.peer = peer;
        self
    }
}

/// The super user, able to perform system-level actions. Its synthetic
/// session carries an immediately-expired claim set; it never round-trips
/// through the token codec.
pub fn super_user() -> Principal {
    system_principal(SUPER_USER_ID, "Admin", "admin@sentra.local")
}

pub fn guest_user() -> Principal {
    system_principal(GUEST_USER_ID, "Guest", "guest@sentra.local")
}

fn system_principal(id: UserId, name: &str, email: &str) -> Principal {
    let now = Utc::now().timestamp();
    Principal {
        user: User {
            id,
            email: email.into(),
            full_name: name.into(),
            password_hash: String::new(),
            verified: true,
            enabled: true,
            mfa_enabled: false,
            totp_secret: None,
        },
        session: Session {
            token_id: "SYSTEM".into(),
            access_token: String::new(),
            claims: Claims { id: "SYSTEM".into(), sub: id.to_string(), iat: now, exp: now },
        },
        peer: None,
        mfa_challenge_pending: false,
    }
}
