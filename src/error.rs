//! Unified application error model and mapping helpers.
//! This module provides the closed set of error conditions surfaced across the
//! HTTP and WebSocket frontends, along with the mapping to HTTP status codes.
//!
//! Account-state conditions (not found, not verified) are deliberately worded
//! and mapped like authentication failures so responses do not reveal whether
//! an account exists. Internal causes must be logged at the site that observed
//! them; only the user-safe message crosses the boundary.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::token::TokenError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Error {
    /// Unknown email or wrong password. Never says which.
    InvalidCredentials,
    UserNotFound,
    UserIsNotVerified,
    AccessDenied,
    /// Token failed signature/structure checks, is expired, or names no live session.
    InvalidToken,
    /// The session lapsed from inactivity rather than token expiry.
    SessionExpired,
    /// The account requires MFA and the challenge has not been completed this session.
    MfaChallengeRequired,
    MfaNotEnabled,
    /// Wrong code, or no challenge/registration in progress. Never says which.
    InvalidMfaCode,
    RequiredParameter { name: String },
    Config { message: String },
    Internal { message: String },
}

impl Error {
    pub fn code_str(&self) -> &'static str {
        match self {
            Error::InvalidCredentials => "invalid_credentials",
            Error::UserNotFound => "user_not_found",
            Error::UserIsNotVerified => "user_not_verified",
            Error::AccessDenied => "access_denied",
            Error::InvalidToken => "invalid_token",
            Error::SessionExpired => "session_expired",
            Error::MfaChallengeRequired => "mfa_challenge_required",
            Error::MfaNotEnabled => "mfa_not_enabled",
            Error::InvalidMfaCode => "invalid_mfa_code",
            Error::RequiredParameter { .. } => "required_parameter",
            Error::Config { .. } => "config_error",
            Error::Internal { .. } => "internal_error",
        }
    }

    /// User-safe message. Internal detail never travels through here.
    pub fn message(&self) -> String {
        match self {
            Error::InvalidCredentials => {
                "Failed to sign in. Please check your email and password.".to_string()
            }
            Error::UserNotFound => "User not found.".to_string(),
            Error::UserIsNotVerified => "This account has not been verified.".to_string(),
            Error::AccessDenied => "Access denied.".to_string(),
            Error::InvalidToken => "Invalid or expired access token.".to_string(),
            Error::SessionExpired => "Session expired due to inactivity.".to_string(),
            Error::MfaChallengeRequired => {
                "An MFA code is required to complete sign in.".to_string()
            }
            Error::MfaNotEnabled => "MFA is not enabled on this account.".to_string(),
            Error::InvalidMfaCode => "MFA code is invalid.".to_string(),
            Error::RequiredParameter { name } => format!("Please provide a value for ({name})."),
            Error::Config { message } => message.clone(),
            Error::Internal { .. } => "Internal server error.".to_string(),
        }
    }

    pub fn config<S: Into<String>>(msg: S) -> Self { Error::Config { message: msg.into() } }
    pub fn internal<S: Into<String>>(msg: S) -> Self { Error::Internal { message: msg.into() } }
    pub fn required<S: Into<String>>(name: S) -> Self { Error::RequiredParameter { name: name.into() } }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::InvalidCredentials
            | Error::UserNotFound
            | Error::UserIsNotVerified
            | Error::InvalidToken
            | Error::SessionExpired
            | Error::MfaChallengeRequired
            | Error::InvalidMfaCode => 401,
            Error::AccessDenied => 403,
            Error::MfaNotEnabled | Error::RequiredParameter { .. } => 400,
            Error::Config { .. } | Error::Internal { .. } => 500,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // Display feeds logs and carries the internal detail; `message()` is
        // what crosses the boundary.
        match self {
            Error::Config { message } | Error::Internal { message } => {
                write!(f, "{}: {}", self.code_str(), message)
            }
            _ => write!(f, "{}: {}", self.code_str(), self.message()),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

impl From<TokenError> for Error {
    fn from(_: TokenError) -> Self {
        // Signature and structure failures are indistinguishable to callers.
        Error::InvalidToken
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal { message: err.to_string() }
    }
}
