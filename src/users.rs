//! # User Enumerator (C2)
//!
//! Resolves the set of real OS users whose per-user snap data directories
//! must be included in a save, or consulted during restore/check.
//!
//! With no explicit username list, every real user is discovered by
//! globbing the configured per-user snap-home pattern (e.g.
//! `/home/*/snap`) plus `root`, then resolving each distinct `uid` through
//! the platform user database so a single account reachable under more
//! than one home path is only included once.

use crate::collab::{UserDb, UserRecord};
use crate::error::{Result, UserError};
use std::collections::HashSet;

/// Default glob pattern for per-user snap home directories.
pub const DEFAULT_HOME_GLOB: &str = "/home/*/snap";

/// Enumerates the users to include in a snapshot.
///
/// `requested`: an explicit username (or numeric uid, as a string) list
/// from the caller. Empty means "all real users".
pub fn enumerate_users(
    user_db: &dyn UserDb,
    home_glob: &str,
    requested: &[String],
) -> Result<Vec<UserRecord>> {
    if requested.is_empty() {
        Ok(enumerate_all(user_db, home_glob))
    } else {
        lookup_requested(user_db, requested)
    }
}

/// Looks up each name in `requested`, falling back to a numeric-uid lookup
/// when the name lookup reports an unknown user. Any other error (I/O,
/// corrupted passwd database) propagates.
fn lookup_requested(user_db: &dyn UserDb, requested: &[String]) -> Result<Vec<UserRecord>> {
    let mut out = Vec::with_capacity(requested.len());
    for name in requested {
        match user_db.lookup(name) {
            Ok(record) => out.push(record),
            Err(UserError::UnknownUser(_)) => {
                let uid: u32 = name
                    .parse()
                    .map_err(|_| UserError::UnknownUser(name.clone()))?;
                out.push(user_db.lookup_id(uid)?);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(out)
}

/// Globs `home_glob` for candidate home directories, derives a username
/// from each leaf's parent component, adds `root` unconditionally, and
/// resolves every distinct `uid` exactly once.
fn enumerate_all(user_db: &dyn UserDb, home_glob: &str) -> Vec<UserRecord> {
    let mut seen_uids = HashSet::new();
    let mut out = Vec::new();

    let mut candidate_names: Vec<String> = Vec::new();
    if let Ok(paths) = glob::glob(home_glob) {
        for entry in paths.flatten() {
            // .../<username>/snap -> <username>
            if let Some(username) = entry
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
            {
                candidate_names.push(username.to_string());
            }
        }
    }
    candidate_names.push("root".to_string());

    for name in candidate_names {
        if let Ok(record) = user_db.lookup(&name) {
            if seen_uids.insert(record.uid) {
                out.push(record);
            }
        }
    }

    out
}

/// `UserDb` backed by the real platform user database via the `users`
/// crate.
pub struct OsUserDb;

impl UserDb for OsUserDb {
    fn lookup(&self, name: &str) -> std::result::Result<UserRecord, UserError> {
        users::get_user_by_name(name)
            .map(|u| UserRecord {
                uid: u.uid(),
                gid: u.primary_group_id(),
                home: u.home_dir().to_path_buf(),
                username: u.name().to_string_lossy().to_string(),
            })
            .ok_or_else(|| UserError::UnknownUser(name.to_string()))
    }

    fn lookup_id(&self, uid: u32) -> std::result::Result<UserRecord, UserError> {
        users::get_user_by_uid(uid)
            .map(|u| UserRecord {
                uid: u.uid(),
                gid: u.primary_group_id(),
                home: u.home_dir().to_path_buf(),
                username: u.name().to_string_lossy().to_string(),
            })
            .ok_or(UserError::UnknownUid(uid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;

    struct FakeUserDb(HashMap<String, UserRecord>, HashMap<u32, UserRecord>);

    impl UserDb for FakeUserDb {
        fn lookup(&self, name: &str) -> std::result::Result<UserRecord, UserError> {
            self.0
                .get(name)
                .cloned()
                .ok_or_else(|| UserError::UnknownUser(name.to_string()))
        }
        fn lookup_id(&self, uid: u32) -> std::result::Result<UserRecord, UserError> {
            self.1.get(&uid).cloned().ok_or(UserError::UnknownUid(uid))
        }
    }

    fn record(uid: u32, name: &str) -> UserRecord {
        UserRecord {
            uid,
            gid: uid,
            home: PathBuf::from(format!("/home/{name}")),
            username: name.to_string(),
        }
    }

    #[test]
    fn explicit_names_resolved_in_order() {
        let mut by_name = HashMap::new();
        by_name.insert("alice".to_string(), record(1000, "alice"));
        by_name.insert("bob".to_string(), record(1001, "bob"));
        let db = FakeUserDb(by_name, HashMap::new());

        let users = enumerate_users(&db, "/unused/*", &["bob".into(), "alice".into()]).unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].username, "bob");
        assert_eq!(users[1].username, "alice");
    }

    #[test]
    fn numeric_fallback_on_unknown_name() {
        let mut by_uid = HashMap::new();
        by_uid.insert(1002, record(1002, "carol"));
        let db = FakeUserDb(HashMap::new(), by_uid);

        let users = enumerate_users(&db, "/unused/*", &["1002".into()]).unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].uid, 1002);
    }

    #[test]
    fn unresolvable_name_and_not_numeric_errors() {
        let db = FakeUserDb(HashMap::new(), HashMap::new());
        let result = enumerate_users(&db, "/unused/*", &["not-a-user".into()]);
        assert!(result.is_err());
    }

    #[test]
    fn propagates_non_unknown_errors() {
        struct AlwaysIo;
        impl UserDb for AlwaysIo {
            fn lookup(&self, _name: &str) -> std::result::Result<UserRecord, UserError> {
                Err(UserError::Io(std::io::Error::other("passwd db exploded")))
            }
            fn lookup_id(&self, uid: u32) -> std::result::Result<UserRecord, UserError> {
                Err(UserError::UnknownUid(uid))
            }
        }
        let result = enumerate_users(&AlwaysIo, "/unused/*", &["whoever".into()]);
        assert!(result.is_err());
    }
}
