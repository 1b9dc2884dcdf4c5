//! Identity keys, X25519 key pairs and prekey bundles

use super::{b64, CryptoError};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair as RingKeyPair, UnparsedPublicKey, ED25519};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// X25519 key pair used for identity, prekeys and ratchet steps
#[derive(Clone)]
pub struct DhKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

impl DhKeyPair {
    /// Generate a fresh random key pair
    pub fn generate() -> Self {
        Self::from_secret_bytes(rand::random::<[u8; 32]>())
    }

    /// Rebuild a key pair from its secret scalar
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public key bytes
    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Secret scalar bytes
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// X25519 shared secret with `their_public`
    pub fn diffie_hellman(&self, their_public: &[u8; 32]) -> Zeroizing<[u8; 32]> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*their_public));
        Zeroizing::new(*shared.as_bytes())
    }
}

/// Public half of a peer identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPublic {
    /// Random id chosen when the identity was created
    pub registration_id: u32,
    /// Ed25519 verification key
    #[serde(with = "b64")]
    pub signing_key: [u8; 32],
    /// X25519 identity key
    #[serde(with = "b64")]
    pub dh_key: [u8; 32],
}

impl IdentityPublic {
    /// SHA256 fingerprint over both public keys
    pub fn fingerprint(&self) -> String {
        use ring::digest;
        let mut ctx = digest::Context::new(&digest::SHA256);
        ctx.update(&self.signing_key);
        ctx.update(&self.dh_key);
        let encoded = BASE64.encode(ctx.finish().as_ref());
        format!("SHA256:{}", encoded.trim_end_matches('='))
    }

    /// Verify an Ed25519 signature made by this identity
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        UnparsedPublicKey::new(&ED25519, &self.signing_key)
            .verify(message, signature)
            .map_err(|_| CryptoError::BadSignature)
    }

    /// Stable textual form used for trust records
    pub fn encode(&self) -> Result<String, CryptoError> {
        serde_json::to_string(self).map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    /// Parse the textual form produced by [`IdentityPublic::encode`]
    pub fn decode(encoded: &str) -> Result<Self, CryptoError> {
        serde_json::from_str(encoded).map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }
}

#[derive(Serialize, Deserialize)]
struct IdentitySecret {
    registration_id: u32,
    #[serde(with = "b64")]
    pkcs8: Vec<u8>,
    #[serde(with = "b64")]
    dh_secret: [u8; 32],
}

impl Drop for IdentitySecret {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.pkcs8.zeroize();
        self.dh_secret.zeroize();
    }
}

/// Long-lived local identity: Ed25519 signing key, X25519 key, registration id
pub struct IdentityKeyPair {
    registration_id: u32,
    pkcs8: Zeroizing<Vec<u8>>,
    signing: Ed25519KeyPair,
    dh: DhKeyPair,
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("registration_id", &self.registration_id)
            .field("fingerprint", &self.public().fingerprint())
            .finish_non_exhaustive()
    }
}

impl IdentityKeyPair {
    /// Generate a new identity
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let pkcs8 =
            Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| CryptoError::KeyGeneration)?;
        let registration_id = (rand::random::<u32>() & 0x3fff) + 1;
        Self::from_parts(registration_id, pkcs8.as_ref().to_vec(), DhKeyPair::generate())
    }

    fn from_parts(
        registration_id: u32,
        pkcs8: Vec<u8>,
        dh: DhKeyPair,
    ) -> Result<Self, CryptoError> {
        let signing = Ed25519KeyPair::from_pkcs8(&pkcs8)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self {
            registration_id,
            pkcs8: Zeroizing::new(pkcs8),
            signing,
            dh,
        })
    }

    /// Registration id
    pub fn registration_id(&self) -> u32 {
        self.registration_id
    }

    /// X25519 identity key pair
    pub fn dh(&self) -> &DhKeyPair {
        &self.dh
    }

    /// Public half
    pub fn public(&self) -> IdentityPublic {
        let mut signing_key = [0u8; 32];
        signing_key.copy_from_slice(self.signing.public_key().as_ref());
        IdentityPublic {
            registration_id: self.registration_id,
            signing_key,
            dh_key: self.dh.public_bytes(),
        }
    }

    /// Ed25519 signature over `message`
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).as_ref().to_vec()
    }

    /// Serialize the private material for sealing
    pub fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let secret = IdentitySecret {
            registration_id: self.registration_id,
            pkcs8: self.pkcs8.to_vec(),
            dh_secret: *self.dh.secret_bytes(),
        };
        serde_json::to_vec(&secret)
            .map(Zeroizing::new)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    /// Restore an identity from [`IdentityKeyPair::to_bytes`] output
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret: IdentitySecret =
            serde_json::from_slice(bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Self::from_parts(
            secret.registration_id,
            secret.pkcs8.clone(),
            DhKeyPair::from_secret_bytes(secret.dh_secret),
        )
    }
}

/// One-time prekey as advertised in a bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKeyPublic {
    /// Prekey id
    pub id: u32,
    /// X25519 public key
    #[serde(with = "b64")]
    pub key: [u8; 32],
}

/// Everything an initiator needs to open a session with a responder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Responder identity
    pub identity: IdentityPublic,
    /// Signed prekey id
    pub signed_prekey_id: u32,
    /// Signed prekey public key
    #[serde(with = "b64")]
    pub signed_prekey: [u8; 32],
    /// Identity signature over the signed prekey
    #[serde(with = "b64")]
    pub signed_prekey_signature: Vec<u8>,
    /// Unconsumed one-time prekey, if the pool is not empty
    pub one_time_prekey: Option<OneTimePreKeyPublic>,
}

impl PreKeyBundle {
    /// Check the signed prekey against the bundle identity
    pub fn verify(&self) -> Result<(), CryptoError> {
        self.identity
            .verify(&self.signed_prekey, &self.signed_prekey_signature)
    }
}
