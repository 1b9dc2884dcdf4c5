//! Peer sessions: durable key material and per-peer encrypted channels
//!
//! [`SecureSessionStore`] owns the local identity, the prekey pools, trusted
//! peer identities and sealed ratchet records. [`SecureChannel`] layers
//! X3DH session establishment and Double Ratchet encryption on top.

pub mod channel;
pub mod store;
pub mod x3dh;

use crate::crypto::CryptoError;
use crate::storage::{SecretError, StorageError};
use thiserror::Error;

pub use channel::{BootstrapMessage, PendingSession, SecureChannel};
pub use store::SecureSessionStore;

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// No established session with the peer
    #[error("No session with peer {0}")]
    NoSession(String),

    /// Message failed to authenticate or decode
    #[error("Bad message from peer {peer}: {reason}")]
    BadMessage { peer: String, reason: String },

    /// The one-time prekey named by a bootstrap message was already used
    #[error("One-time prekey {0} already consumed")]
    PreKeyConsumed(u32),

    /// Bootstrap references a signed prekey we no longer hold
    #[error("Unknown signed prekey {0}")]
    UnknownPreKey(u32),

    /// Bootstrap from a peer whose identity was never accepted
    #[error("Identity of peer {0} is not trusted")]
    UntrustedIdentity(String),

    /// Crypto failure
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Storage failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Sealing failure
    #[error("Secret store error: {0}")]
    Secret(#[from] SecretError),
}

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
