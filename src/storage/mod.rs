//! Durable state for the sync engine
//!
//! All persistent state lives in a single SQLite database: local identity
//! and prekeys, per-peer ratchet sessions, trusted identities, peer runtime
//! records, the blacklist and the task table. Private key material is sealed
//! with a master key obtained from a [`SecretStore`].

pub mod database;
pub mod keys;
pub mod peers;
pub mod secret;
pub mod tasks;

use thiserror::Error;

pub use database::Database;
pub use keys::{SealedRow, StoredPreKey};
pub use secret::{
    FileSecretStore, MemorySecretStore, SealedBlob, SecretBackend, SecretError, SecretStore,
    Sealer,
};

#[cfg(any(target_os = "macos", target_os = "windows"))]
pub use secret::KeyringSecretStore;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// SQLite error
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Row payload could not be (de)serialized
    #[error("Corrupt record: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error creating the database directory
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Stored value has an unknown encoding
    #[error("Invalid stored value: {0}")]
    Invalid(String),
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;
