//! Client account store
//!
//! Keeps user accounts with salted password hashes and hands out opaque
//! session tokens. A fresh login invalidates the previous token for that
//! account. Credentials are never stored or logged in the clear.

use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::RwLock;

// ============================================================================
// Credential helpers (shared with the collector registry)
// ============================================================================

/// Generate a random 16-byte salt, hex-encoded.
pub(crate) fn generate_salt() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    to_hex(&bytes)
}

/// Salted SHA-256 digest of a secret, hex-encoded.
pub(crate) fn hash_secret(secret: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(secret.as_bytes());
    to_hex(&hasher.finalize())
}

/// Verify a secret against a stored salt/hash pair.
pub(crate) fn verify_secret(secret: &str, salt: &str, expected_hash: &str) -> bool {
    hash_secret(secret, salt) == expected_hash
}

/// Generate an opaque session token (UUID v4, hex form).
pub(crate) fn generate_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ============================================================================
// Errors
// ============================================================================

/// User account errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Username already taken
    DuplicateUsername(String),

    /// Unknown username or wrong password
    InvalidCredentials,

    /// Token does not map to a live session
    UnknownToken,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateUsername(name) => write!(f, "Username already taken: {name}"),
            Self::InvalidCredentials => write!(f, "Invalid credentials"),
            Self::UnknownToken => write!(f, "Unknown or expired token"),
        }
    }
}

impl std::error::Error for AuthError {}

// ============================================================================
// User Store
// ============================================================================

#[derive(Debug, Clone)]
struct UserRecord {
    salt: String,
    password_hash: String,
    session_token: Option<String>,
}

/// In-memory account store for task-submitting clients.
pub struct UserStore {
    users: RwLock<HashMap<String, UserRecord>>,

    /// token -> username
    tokens: RwLock<HashMap<String, String>>,
}

impl UserStore {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new account.
    pub async fn register(&self, username: &str, password: &str) -> Result<(), AuthError> {
        let mut users = self.users.write().await;

        if users.contains_key(username) {
            return Err(AuthError::DuplicateUsername(username.to_string()));
        }

        let salt = generate_salt();
        let password_hash = hash_secret(password, &salt);
        users.insert(
            username.to_string(),
            UserRecord {
                salt,
                password_hash,
                session_token: None,
            },
        );

        tracing::info!(username, "Registered client account");
        Ok(())
    }

    /// Authenticate and issue a fresh session token.
    ///
    /// Any previous token for the account stops working.
    pub async fn login(&self, username: &str, password: &str) -> Result<String, AuthError> {
        let mut users = self.users.write().await;

        let record = users.get_mut(username).ok_or(AuthError::InvalidCredentials)?;
        if !verify_secret(password, &record.salt, &record.password_hash) {
            return Err(AuthError::InvalidCredentials);
        }

        let token = generate_token();
        let mut tokens = self.tokens.write().await;
        if let Some(old) = record.session_token.replace(token.clone()) {
            tokens.remove(&old);
        }
        tokens.insert(token.clone(), username.to_string());

        tracing::info!(username, "Client logged in");
        Ok(token)
    }

    /// Resolve a session token to its username.
    pub async fn authenticate(&self, token: &str) -> Result<String, AuthError> {
        self.tokens
            .read()
            .await
            .get(token)
            .cloned()
            .ok_or(AuthError::UnknownToken)
    }

    /// Number of registered accounts.
    pub async fn count(&self) -> usize {
        self.users.read().await.len()
    }
}

impl Default for UserStore {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
