//! # Bearer Token Authentication
//!
//! Maps opaque bearer tokens to usernames. The table is seeded from the
//! tokens file at startup (a JSON object of `username -> token`); further
//! tokens are issued by `POST /auth` and revoked by `DELETE /auth`.
//!
//! Every token is valid for one hour — seeded tokens from process start,
//! issued tokens from the moment of issue — and is never renewed. Authorizing
//! is a shared-read lookup; login and logout take the write lock.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::{Error, Result};

/// How long any token stays valid.
pub const TOKEN_VALIDITY: Duration = Duration::from_secs(60 * 60);

/// Length of issued bearer tokens.
pub const TOKEN_LENGTH: usize = 16;

struct AuthEntry {
    username: String,
    expires_at: Instant,
}

/// The process-wide token table.
pub struct TokenTable {
    entries: RwLock<HashMap<String, AuthEntry>>,
}

impl TokenTable {
    /// An empty table with no seeded tokens.
    pub fn new() -> Self {
        TokenTable {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Loads the tokens file: a JSON object mapping usernames to tokens.
    /// Every seeded token expires [`TOKEN_VALIDITY`] after this call.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let user_tokens: HashMap<String, String> = serde_json::from_str(&text)?;

        let expires_at = Instant::now() + TOKEN_VALIDITY;
        let entries = user_tokens
            .into_iter()
            .map(|(username, token)| (token, AuthEntry { username, expires_at }))
            .collect();
        Ok(TokenTable {
            entries: RwLock::new(entries),
        })
    }

    /// Resolves a token to its username. Unknown or expired tokens are
    /// rejected; expiry is checked at lookup time, not swept in the
    /// background.
    pub fn authorize(&self, token: &str) -> Result<String> {
        let entries = self.entries.read();
        match entries.get(token) {
            Some(entry) if Instant::now() < entry.expires_at => Ok(entry.username.clone()),
            _ => Err(unauthorized()),
        }
    }

    /// Issues a fresh bearer token for `username`, retrying generation until
    /// the token is unique in the table.
    pub fn login(&self, username: &str) -> String {
        let mut entries = self.entries.write();

        let mut token = generate_token();
        while entries.contains_key(&token) {
            token = generate_token();
        }

        entries.insert(
            token.clone(),
            AuthEntry {
                username: username.to_string(),
                expires_at: Instant::now() + TOKEN_VALIDITY,
            },
        );
        token
    }

    /// Invalidates the given token. Errors if the token is not present.
    pub fn logout(&self, token: &str) -> Result<()> {
        let mut entries = self.entries.write();
        match entries.remove(token) {
            Some(_) => Ok(()),
            None => Err(unauthorized()),
        }
    }
}

impl Default for TokenTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Extracts the token from an `Authorization` header, which must be exactly
/// `Bearer <token>`.
pub fn bearer_token(header: Option<&str>) -> Result<&str> {
    match header {
        Some(value) if value.len() > 7 && value.starts_with("Bearer ") => Ok(&value[7..]),
        _ => Err(unauthorized()),
    }
}

fn unauthorized() -> Error {
    Error::Unauthorized("missing or invalid bearer token".to_string())
}

fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_then_authorize() {
        let table = TokenTable::new();
        let token = table.login("alice");
        assert_eq!(token.len(), TOKEN_LENGTH);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(table.authorize(&token).unwrap(), "alice");
    }

    #[test]
    fn test_unknown_token_rejected() {
        let table = TokenTable::new();
        let err = table.authorize("nope").unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[test]
    fn test_logout_invalidates() {
        let table = TokenTable::new();
        let token = table.login("alice");
        table.logout(&token).unwrap();
        assert!(table.authorize(&token).is_err());
        // Second logout of the same token is an error.
        assert!(table.logout(&token).is_err());
    }

    #[test]
    fn test_tokens_are_distinct() {
        let table = TokenTable::new();
        let first = table.login("alice");
        let second = table.login("alice");
        assert_ne!(first, second);
    }

    #[test]
    fn test_bearer_header_parsing() {
        assert_eq!(bearer_token(Some("Bearer abcdef1234567890")).unwrap(), "abcdef1234567890");
        assert!(bearer_token(None).is_err());
        assert!(bearer_token(Some("")).is_err());
        assert!(bearer_token(Some("Bearer")).is_err());
        assert!(bearer_token(Some("Bearer ")).is_err());
        assert!(bearer_token(Some("Basic abc")).is_err());
    }

    #[test]
    fn test_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"alice": "token-a", "bob": "token-b"}}"#).unwrap();

        let table = TokenTable::from_file(file.path()).unwrap();
        assert_eq!(table.authorize("token-a").unwrap(), "alice");
        assert_eq!(table.authorize("token-b").unwrap(), "bob");
        assert!(table.authorize("token-c").is_err());
    }
}
