use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{StoreError, StoreResult};

/// Keyed username → password table behind the pool.
///
/// `insert` returns `false` when the username is already taken; callers
/// treat that as a registration conflict, not an error.
pub trait CredentialBackend: Send + Sync {
    fn lookup(&self, username: &str) -> StoreResult<Option<String>>;
    fn insert(&self, username: &str, password: &str) -> StoreResult<bool>;
}

/// In-process credential table.
///
/// Plays the role the preloaded user snapshot plays in a database-backed
/// deployment: lookups never leave the process.
#[derive(Default)]
pub struct MemoryBackend {
    users: RwLock<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the table, e.g. from a credentials file at startup.
    pub fn with_users<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        let users = users
            .into_iter()
            .map(|(u, p)| (u.into(), p.into()))
            .collect();
        Self {
            users: RwLock::new(users),
        }
    }
}

impl CredentialBackend for MemoryBackend {
    fn lookup(&self, username: &str) -> StoreResult<Option<String>> {
        let users = self
            .users
            .read()
            .map_err(|_| StoreError::Backend("user table lock poisoned".into()))?;
        Ok(users.get(username).cloned())
    }

    fn insert(&self, username: &str, password: &str) -> StoreResult<bool> {
        let mut users = self
            .users
            .write()
            .map_err(|_| StoreError::Backend("user table lock poisoned".into()))?;
        if users.contains_key(username) {
            return Ok(false);
        }
        users.insert(username.to_string(), password.to_string());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_and_insert() {
        let backend = MemoryBackend::with_users([("alice", "secret")]);
        assert_eq!(backend.lookup("alice").unwrap().as_deref(), Some("secret"));
        assert_eq!(backend.lookup("bob").unwrap(), None);

        assert!(backend.insert("bob", "hunter2").unwrap());
        assert_eq!(backend.lookup("bob").unwrap().as_deref(), Some("hunter2"));
    }

    #[test]
    fn insert_rejects_duplicates() {
        let backend = MemoryBackend::with_users([("alice", "secret")]);
        assert!(!backend.insert("alice", "other").unwrap());
        // First password wins.
        assert_eq!(backend.lookup("alice").unwrap().as_deref(), Some("secret"));
    }
}
