//! Cryptographic primitives for peer sessions
//!
//! - [`kdf`]: HKDF-SHA256 and the symmetric chain step
//! - [`keys`]: long-lived identity keys, X25519 key pairs and prekey bundles
//! - [`ratchet`]: the Double Ratchet state carried by every session

pub mod kdf;
pub mod keys;
pub mod ratchet;

use thiserror::Error;

pub use keys::{
    DhKeyPair, IdentityKeyPair, IdentityPublic, OneTimePreKeyPublic, PreKeyBundle,
};
pub use ratchet::{MessageHeader, RatchetMessage, RatchetState};

/// Crypto errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Random key generation failed
    #[error("Key generation failed")]
    KeyGeneration,

    /// Key bytes could not be parsed
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// Prekey signature did not verify
    #[error("Signature verification failed")]
    BadSignature,

    /// AEAD encryption failed
    #[error("Encryption failed")]
    Encrypt,

    /// AEAD authentication failed
    #[error("Decryption failed")]
    Decrypt,

    /// Session has no sending chain yet
    #[error("Session cannot send before receiving")]
    NoSendingChain,

    /// Message is too far ahead of the receiving chain
    #[error("Too many skipped messages")]
    TooManySkipped,

    /// Message key already used or discarded
    #[error("Duplicate message")]
    Duplicate,
}

/// Serde helper encoding byte fields as standard base64 strings
pub mod b64 {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&BASE64.encode(value.as_ref()))
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<Vec<u8>>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = BASE64.decode(encoded.as_bytes()).map_err(de::Error::custom)?;
        T::try_from(bytes).map_err(|_| de::Error::custom("unexpected byte length"))
    }
}
