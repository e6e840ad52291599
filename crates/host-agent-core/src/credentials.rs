//! Bearer token issuance and authorization.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::clock::now_millis;

/// Prefix expected in the `Authorization` header.
pub const BEARER_PREFIX: &str = "Bearer ";

/// An issued access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    /// Opaque token string presented by operators.
    pub token: String,
    /// Issuance time (Unix epoch millis).
    pub issued_at: i64,
}

/// Authorization failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing credential")]
    Missing,
    #[error("Malformed credential")]
    Malformed,
    #[error("Invalid credential")]
    Invalid,
}

/// Store of issued access tokens.
///
/// Tokens never expire; a token authorizes calls for as long as it is held.
/// Lookups take a shared lock, so concurrent request handlers never observe
/// a half-inserted entry.
#[derive(Debug, Default)]
pub struct CredentialStore {
    tokens: RwLock<HashMap<String, i64>>,
}

impl CredentialStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh random token and record it.
    pub fn issue(&self) -> AccessToken {
        let token = AccessToken {
            token: Uuid::new_v4().to_string(),
            issued_at: now_millis(),
        };
        self.write().insert(token.token.clone(), token.issued_at);
        token
    }

    /// Register an operator-provided token.
    pub fn insert(&self, token: impl Into<String>) -> AccessToken {
        let token = AccessToken {
            token: token.into(),
            issued_at: now_millis(),
        };
        self.write()
            .entry(token.token.clone())
            .or_insert(token.issued_at);
        token
    }

    /// Whether `token` is currently held.
    #[must_use]
    pub fn is_valid(&self, token: &str) -> bool {
        !token.is_empty() && self.read().contains_key(token)
    }

    /// Issuance time of a held token.
    #[must_use]
    pub fn issued_at(&self, token: &str) -> Option<i64> {
        self.read().get(token).copied()
    }

    /// Revoke a token. Returns whether it was held.
    pub fn revoke(&self, token: &str) -> bool {
        self.write().remove(token).is_some()
    }

    /// Number of held tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether no tokens are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Authorize an `Authorization` header value.
    ///
    /// # Errors
    /// Returns [`AuthError`] when the header is absent, not a bearer
    /// credential, or names an unknown token.
    pub fn authorize_header(&self, header: Option<&str>) -> Result<(), AuthError> {
        let header = header.ok_or(AuthError::Missing)?;
        let token = header
            .strip_prefix(BEARER_PREFIX)
            .map(str::trim)
            .ok_or(AuthError::Malformed)?;
        if self.is_valid(token) {
            Ok(())
        } else {
            Err(AuthError::Invalid)
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, i64>> {
        self.tokens.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, i64>> {
        self.tokens.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_issued_token_is_valid() {
        let store = CredentialStore::new();
        let token = store.issue();
        assert!(store.is_valid(&token.token));
        assert_eq!(store.issued_at(&token.token), Some(token.issued_at));
        assert!(!store.is_valid("not-a-token"));
        assert!(!store.is_valid(""));
    }

    #[test]
    fn test_tokens_are_unique() {
        let store = CredentialStore::new();
        let a = store.issue();
        let b = store.issue();
        assert_ne!(a.token, b.token);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_revoke() {
        let store = CredentialStore::new();
        let token = store.issue();
        assert!(store.revoke(&token.token));
        assert!(!store.is_valid(&token.token));
        assert!(!store.revoke(&token.token));
    }

    #[test]
    fn test_insert_keeps_first_issuance() {
        let store = CredentialStore::new();
        let first = store.insert("static-token");
        store.insert("static-token");
        assert_eq!(store.issued_at("static-token"), Some(first.issued_at));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_authorize_header() {
        let store = CredentialStore::new();
        let token = store.issue();
        let header = format!("Bearer {}", token.token);

        assert_eq!(store.authorize_header(Some(&header)), Ok(()));
        assert_eq!(store.authorize_header(None), Err(AuthError::Missing));
        assert_eq!(
            store.authorize_header(Some(&token.token)),
            Err(AuthError::Malformed)
        );
        assert_eq!(
            store.authorize_header(Some("Bearer nope")),
            Err(AuthError::Invalid)
        );
    }

    #[test]
    fn test_concurrent_issue_and_check() {
        let store = Arc::new(CredentialStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| store.issue())
                        .all(|t| store.is_valid(&t.token))
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(store.len(), 800);
    }
}
