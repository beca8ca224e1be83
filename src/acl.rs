//! Structural ACL evaluation.
//!
//! An object exposes an ordered list of entries; each entry pairs a set of
//! permitted operations with a subject — everyone, a single user, a group of
//! users, or a nested list of entries (groups of groups). `check_access` is a
//! pure predicate over that structure: any object type that can expose an ACL
//! list can be checked without the evaluator knowing its concrete type.
//!
//! There is no explicit-deny entry kind. An empty list denies everything to
//! non-super-users; the first entry that allows the operation wins.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identity::{Principal, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AclOp {
    Read,
    Write,
    Delete,
    Execute,
}

impl AclOp {
    pub const ALL: [AclOp; 4] = [AclOp::Read, AclOp::Write, AclOp::Delete, AclOp::Execute];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AclSubject {
    /// Special case that includes all users.
    Everyone,
    User { id: UserId },
    /// Also used to model teams.
    Group { ids: Vec<UserId> },
    /// Nested entries, evaluated recursively against the parent entry's
    /// operation set.
    Entities { entries: Vec<AclEntry> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    /// Display name of the entry; groups need one, individuals inherit the
    /// user's name.
    pub name: String,
    pub operations: Vec<AclOp>,
    pub subject: AclSubject,
}

impl AclEntry {
    /// Common entry attached to objects created by a specific user.
    pub fn owner(user_id: UserId) -> Self {
        Self {
            name: "Owner".into(),
            operations: AclOp::ALL.to_vec(),
            subject: AclSubject::User { id: user_id },
        }
    }
}

/// Anything that exposes an ACL list.
pub trait AclObject {
    fn acl(&self) -> &[AclEntry];
}

/// Check a principal's access to an ACL object.
///
/// The super user always passes — the bypass is total and intentional.
/// Disabled accounts fail as `UserNotFound` (deliberately ambiguous with
/// "no such account"), unverified as `UserIsNotVerified`. An object with no
/// entries denies all other principals.
pub fn check_access(principal: &Principal, object: &dyn AclObject, op: AclOp) -> Result<()> {
    if principal.is_super_user() {
        return Ok(());
    }
    if !principal.enabled() {
        return Err(Error::UserNotFound);
    }
    if !principal.verified() {
        return Err(Error::UserIsNotVerified);
    }
    let acl = object.acl();
    if acl.is_empty() {
        return Err(Error::AccessDenied);
    }
    for entry in acl {
        if subject_allows(principal.user.id, &entry.subject, &entry.operations, op) {
            return Ok(());
        }
    }
    Err(Error::AccessDenied)
}

fn subject_allows(user_id: UserId, subject: &AclSubject, ops: &[AclOp], op: AclOp) -> bool {
    match subject {
        AclSubject::Everyone => ops.contains(&op),
        AclSubject::User { id } => *id == user_id && ops.contains(&op),
        AclSubject::Group { ids } => ids.contains(&user_id) && ops.contains(&op),
        AclSubject::Entities { entries } => entries
            .iter()
            .any(|entry| subject_allows(user_id, &entry.subject, ops, op)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{guest_user, super_user};

    struct FakeObject {
        acl: Vec<AclEntry>,
    }

    impl AclObject for FakeObject {
        fn acl(&self) -> &[AclEntry] {
            &self.acl
        }
    }

    fn entry(operations: Vec<AclOp>, subject: AclSubject) -> AclEntry {
        AclEntry { name: "entry".into(), operations, subject }
    }

    #[test]
    fn super_user_bypasses_everything() {
        let object = FakeObject { acl: vec![] };
        for op in AclOp::ALL {
            check_access(&super_user(), &object, op).unwrap();
        }
    }

    #[test]
    fn empty_acl_denies_by_default() {
        let object = FakeObject { acl: vec![] };
        for op in AclOp::ALL {
            assert_eq!(
                check_access(&guest_user(), &object, op),
                Err(Error::AccessDenied)
            );
        }
    }

    #[test]
    fn disabled_and_unverified_principals() {
        let object = FakeObject {
            acl: vec![entry(vec![AclOp::Read], AclSubject::Everyone)],
        };
        let mut disabled = guest_user();
        disabled.user.enabled = false;
        assert_eq!(
            check_access(&disabled, &object, AclOp::Read),
            Err(Error::UserNotFound)
        );

        let mut unverified = guest_user();
        unverified.user.verified = false;
        assert_eq!(
            check_access(&unverified, &object, AclOp::Read),
            Err(Error::UserIsNotVerified)
        );
    }

    #[test]
    fn everyone_subject() {
        let object = FakeObject {
            acl: vec![entry(vec![AclOp::Read], AclSubject::Everyone)],
        };
        check_access(&guest_user(), &object, AclOp::Read).unwrap();
        assert_eq!(
            check_access(&guest_user(), &object, AclOp::Write),
            Err(Error::AccessDenied)
        );
    }

    #[test]
    fn individual_subject() {
        let me = guest_user();
        let object = FakeObject {
            acl: vec![entry(vec![AclOp::Read], AclSubject::User { id: me.user.id })],
        };
        check_access(&me, &object, AclOp::Read).unwrap();
        assert_eq!(
            check_access(&me, &object, AclOp::Write),
            Err(Error::AccessDenied)
        );

        let object = FakeObject {
            acl: vec![entry(vec![AclOp::Read], AclSubject::User { id: 9999 })],
        };
        assert_eq!(
            check_access(&me, &object, AclOp::Read),
            Err(Error::AccessDenied)
        );
    }

    #[test]
    fn group_subject() {
        let me = guest_user();
        let object = FakeObject {
            acl: vec![entry(
                vec![AclOp::Read],
                AclSubject::Group { ids: vec![77, me.user.id] },
            )],
        };
        check_access(&me, &object, AclOp::Read).unwrap();

        let object = FakeObject {
            acl: vec![entry(vec![AclOp::Read], AclSubject::Group { ids: vec![77, 78] })],
        };
        assert_eq!(
            check_access(&me, &object, AclOp::Read),
            Err(Error::AccessDenied)
        );
    }

    #[test]
    fn nested_entries_recurse_to_a_match() {
        let me = guest_user();
        // Three levels deep; the match sits at the bottom.
        let object = FakeObject {
            acl: vec![entry(
                vec![AclOp::Read],
                AclSubject::Entities {
                    entries: vec![entry(
                        vec![],
                        AclSubject::Entities {
                            entries: vec![entry(vec![], AclSubject::User { id: me.user.id })],
                        },
                    )],
                },
            )],
        };
        check_access(&me, &object, AclOp::Read).unwrap();
        // The parent entry's operation set governs the whole subtree.
        assert_eq!(
            check_access(&me, &object, AclOp::Write),
            Err(Error::AccessDenied)
        );
    }

    #[test]
    fn later_entry_can_allow_after_earlier_miss() {
        let me = guest_user();
        let object = FakeObject {
            acl: vec![
                entry(vec![AclOp::Read], AclSubject::User { id: 9999 }),
                entry(vec![AclOp::Read], AclSubject::User { id: me.user.id }),
            ],
        };
        check_access(&me, &object, AclOp::Read).unwrap();
    }

    #[test]
    fn owner_entry_grants_all_ops() {
        let me = guest_user();
        let object = FakeObject { acl: vec![AclEntry::owner(me.user.id)] };
        for op in AclOp::ALL {
            check_access(&me, &object, op).unwrap();
        }
    }
}
