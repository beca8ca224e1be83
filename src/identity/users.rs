//! User records and the credential store seam.
//!
//! The store is a narrow collaborator: lookup by email or id, create, update.
//! The default implementation is in-memory; anything satisfying `UserStore`
//! (a SQL-backed store, a fake in tests) can be injected into the session
//! authority instead.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{GUEST_USER_ID, SUPER_USER_ID};
use crate::security;

pub type UserId = i64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub full_name: String,
    /// Argon2 PHC string. Never serialized into responses.
    #[serde(skip_serializing)]
    #[serde(default)]
    pub password_hash: String,
    pub verified: bool,
    pub enabled: bool,
    pub mfa_enabled: bool,
    #[serde(skip_serializing)]
    #[serde(default)]
    pub totp_secret: Option<String>,
}

pub trait UserStore: Send + Sync {
    fn find_by_email(&self, email: &str) -> Option<User>;
    fn find_by_id(&self, id: UserId) -> Option<User>;
    /// Assigns the id. Fails if the email is already taken.
    fn create(&self, user: NewUser) -> Result<User>;
    fn update(&self, user: &User) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub full_name: String,
    pub password_hash: String,
    pub verified: bool,
    pub enabled: bool,
}

/// In-memory credential store. Seeds the well-known super user and guest
/// records on construction.
pub struct MemoryUserStore {
    inner: RwLock<Inner>,
}

struct Inner {
    users: HashMap<UserId, User>,
    next_id: UserId,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        let mut users = HashMap::new();
        users.insert(
            SUPER_USER_ID,
            User {
                id: SUPER_USER_ID,
                email: "admin@sentra.local".into(),
                full_name: "Admin".into(),
                password_hash: String::new(),
                verified: true,
                enabled: true,
                mfa_enabled: false,
                totp_secret: None,
            },
        );
        users.insert(
            GUEST_USER_ID,
            User {
                id: GUEST_USER_ID,
                email: "guest@sentra.local".into(),
                full_name: "Guest".into(),
                password_hash: String::new(),
                verified: true,
                enabled: true,
                mfa_enabled: false,
                totp_secret: None,
            },
        );
        Self { inner: RwLock::new(Inner { users, next_id: GUEST_USER_ID + 1 }) }
    }

    /// Give the seeded admin a usable password if it has none yet.
    /// First-run convenience, same idea as the reference store's default admin.
    pub fn ensure_admin_password(&self, password: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let admin = inner
            .users
            .get_mut(&SUPER_USER_ID)
            .ok_or_else(|| anyhow!("super user record missing"))?;
        if admin.password_hash.is_empty() {
            admin.password_hash = security::hash_password(password)?;
            info!("seeded default admin password for user ({})", SUPER_USER_ID);
        }
        Ok(())
    }
}

impl Default for MemoryUserStore {
    fn default() -> Self { Self::new() }
}

impl UserStore for MemoryUserStore {
    fn find_by_email(&self, email: &str) -> Option<User> {
        let inner = self.inner.read();
        inner
            .users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned()
    }

    fn find_by_id(&self, id: UserId) -> Option<User> {
        self.inner.read().users.get(&id).cloned()
    }

    fn create(&self, user: NewUser) -> Result<User> {
        let mut inner = self.inner.write();
        if inner
            .users
            .values()
            .any(|u| u.email.eq_ignore_ascii_case(&user.email))
        {
            return Err(anyhow!("email already registered"));
        }
        let id = inner.next_id;
        inner.next_id += 1;
        let record = User {
            id,
            email: user.email,
            full_name: user.full_name,
            password_hash: user.password_hash,
            verified: user.verified,
            enabled: user.enabled,
            mfa_enabled: false,
            totp_secret: None,
        };
        inner.users.insert(id, record.clone());
        Ok(record)
    }

    fn update(&self, user: &User) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.users.get_mut(&user.id) {
            Some(slot) => {
                *slot = user.clone();
                Ok(())
            }
            None => Err(anyhow!("user ({}) not found", user.id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_well_known_users() {
        let store = MemoryUserStore::new();
        assert!(store.find_by_id(SUPER_USER_ID).is_some());
        assert!(store.find_by_id(GUEST_USER_ID).is_some());
    }

    #[test]
    fn create_rejects_duplicate_email() {
        let store = MemoryUserStore::new();
        let user = NewUser {
            email: "eric@example.com".into(),
            full_name: "Eric".into(),
            password_hash: "x".into(),
            verified: true,
            enabled: true,
        };
        let created = store.create(user.clone()).unwrap();
        assert!(created.id > GUEST_USER_ID);
        assert!(store.create(user).is_err());
        // Lookup is case-insensitive on email.
        assert_eq!(store.find_by_email("ERIC@example.com").unwrap().id, created.id);
    }
}
