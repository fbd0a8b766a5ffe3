//! Per-user authentication and permission records.
//!
//! The user database is a JSON list of entries: a password, a default
//! access policy, and a set of regex patterns over permission names that
//! invert the default for whatever they match.

use std::{
    collections::HashMap,
    path::Path,
};

use serde::Deserialize;

use crate::source::Permissions;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed user database: {0}")]
    Json(#[from] serde_json::Error),
    #[error("user {user:?}: bad exception pattern {pattern:?}: {error}")]
    BadPattern {
        user: String,
        pattern: String,
        error: regex::Error,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultAccess {
    #[default]
    Allow,
    Deny,
}

#[derive(Debug, Deserialize)]
struct UserEntry {
    user: String,
    password: String,
    #[serde(default)]
    default_access: DefaultAccess,
    #[serde(default)]
    exceptions: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct UserRecord {
    pub password: String,
    pub permissions: Permissions,
}

#[derive(Clone, Debug, Default)]
pub struct UserDb {
    users: HashMap<String, UserRecord>,
}

/// Permissions whose names match any of `patterns`.
fn matched_permissions(patterns: &[regex::Regex]) -> Permissions {
    let mut matched = Permissions::empty();
    for (name, permission) in Permissions::NAMES {
        if patterns.iter().any(|pattern| pattern.is_match(name)) {
            matched |= *permission;
        }
    }
    matched
}

impl UserDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user directly (used by tests and embedders).
    pub fn register(&mut self, user: &str, password: &str, permissions: Permissions) {
        self.users.insert(
            user.to_owned(),
            UserRecord {
                password: password.to_owned(),
                permissions,
            },
        );
    }

    pub fn lookup(&self, user: &str) -> Option<&UserRecord> {
        self.users.get(user)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn from_json(raw: &[u8]) -> Result<Self, Error> {
        let entries: Vec<UserEntry> = serde_json::from_slice(raw)?;
        let mut users = HashMap::with_capacity(entries.len());

        for entry in entries {
            let patterns = entry
                .exceptions
                .iter()
                .map(|pattern| {
                    regex::Regex::new(pattern).map_err(|error| {
                        Error::BadPattern {
                            user: entry.user.clone(),
                            pattern: pattern.clone(),
                            error,
                        }
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            let exceptions = matched_permissions(&patterns);
            let permissions = match entry.default_access {
                DefaultAccess::Allow => Permissions::all() - exceptions,
                DefaultAccess::Deny => exceptions,
            };

            users.insert(
                entry.user,
                UserRecord {
                    password: entry.password,
                    permissions,
                },
            );
        }

        Ok(Self { users })
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        Self::from_json(&std::fs::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_with_exceptions_clears_matched_bits() {
        let db = UserDb::from_json(
            br#"[{
                "user": "viewer",
                "password": "secret",
                "default_access": "allow",
                "exceptions": ["^source\\.", "analyzer.halt"]
            }]"#,
        )
        .unwrap();

        let record = db.lookup("viewer").unwrap();
        assert!(!record.permissions.contains(Permissions::SET_FREQ));
        assert!(!record.permissions.contains(Permissions::HALT));
        assert!(record.permissions.contains(Permissions::OPEN_AUDIO));
        assert!(record.permissions.contains(Permissions::SET_FFT_SIZE));
    }

    #[test]
    fn deny_with_exceptions_sets_only_matched_bits() {
        let db = UserDb::from_json(
            br#"[{
                "user": "guest",
                "password": "guest",
                "default_access": "deny",
                "exceptions": ["inspector\\.open\\..*"]
            }]"#,
        )
        .unwrap();

        let record = db.lookup("guest").unwrap();
        assert!(record.permissions.contains(Permissions::OPEN_AUDIO));
        assert!(record.permissions.contains(Permissions::OPEN_RAW));
        assert!(!record.permissions.contains(Permissions::SET_FREQ));
    }

    #[test]
    fn default_access_defaults_to_allow_everything() {
        let db = UserDb::from_json(br#"[{"user": "root", "password": "toor"}]"#).unwrap();
        assert_eq!(db.lookup("root").unwrap().permissions, Permissions::all());
    }

    #[test]
    fn bad_pattern_is_reported_with_context() {
        let result = UserDb::from_json(
            br#"[{"user": "x", "password": "y", "exceptions": ["("]}]"#,
        );
        assert!(matches!(result, Err(Error::BadPattern { .. })));
    }
}
