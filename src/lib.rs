//! # ClipMesh
//!
//! Secure peer synchronization engine for devices on the same network.
//!
//! Peers find each other over mDNS, pair through a short token the user
//! confirms on both screens, and then talk over an end-to-end encrypted
//! session (X3DH handshake followed by a Double Ratchet). Each tracked peer
//! has a [`sync::SyncHandler`] that keeps the connection state current, and
//! resources are pulled through persistent, retryable background tasks.

pub mod cli;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod node;
pub mod session;
pub mod storage;
pub mod sync;
pub mod tasks;

pub use config::Config;
pub use node::Node;

/// Result type alias for ClipMesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for ClipMesh operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Persistence error
    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// Key material error
    #[error("Secret store error: {0}")]
    Secret(#[from] storage::SecretError),

    /// Cryptographic failure
    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    /// Session or handshake failure
    #[error("Session error: {0}")]
    Session(#[from] session::SessionError),

    /// Peer request failure
    #[error(transparent)]
    Client(#[from] sync::ClientError),

    /// Peer state failure
    #[error(transparent)]
    Sync(#[from] sync::SyncError),

    /// Task failure
    #[error(transparent)]
    Task(#[from] tasks::TaskError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
