//! Durable identity, prekey, trust and session material

use super::{Result, SessionError};
use crate::crypto::{
    DhKeyPair, IdentityKeyPair, IdentityPublic, OneTimePreKeyPublic, PreKeyBundle, RatchetState,
};
use crate::storage::{Database, SealedBlob, Sealer, SecretStore, StoredPreKey};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Signed prekeys older than this are replaced
const SIGNED_PREKEY_ROTATION_DAYS: i64 = 7;

/// Signed prekeys kept so in-flight bootstraps against the previous one still work
const SIGNED_PREKEYS_KEPT: usize = 2;

/// Replenish the one-time pool when it drops below this
const ONE_TIME_PREKEY_LOW_WATER: usize = 5;

/// Size of a freshly replenished one-time pool
const ONE_TIME_PREKEY_POOL: usize = 20;

/// Durable key and session material for this installation
pub struct SecureSessionStore {
    db: Arc<Database>,
    sealer: Sealer,
    identity: Mutex<Option<Arc<IdentityKeyPair>>>,
    prekeys: Mutex<()>,
}

impl std::fmt::Debug for SecureSessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSessionStore").finish_non_exhaustive()
    }
}

impl SecureSessionStore {
    /// Create a store sealing material with the master key from `secrets`
    pub fn new(db: Arc<Database>, secrets: &dyn SecretStore) -> Result<Self> {
        let sealer = Sealer::from_store(secrets)?;
        debug!("Session store using {} secret backend", secrets.name());
        Ok(Self {
            db,
            sealer,
            identity: Mutex::new(None),
            prekeys: Mutex::new(()),
        })
    }

    /// The local identity, generated and persisted on first use.
    ///
    /// Stored material that can no longer be unsealed is discarded together
    /// with every prekey and session, and a new identity takes its place.
    pub async fn identity(&self) -> Result<Arc<IdentityKeyPair>> {
        let mut cached = self.identity.lock().await;
        if let Some(identity) = cached.as_ref() {
            return Ok(identity.clone());
        }

        let identity = match self.db.load_identity().await? {
            Some(row) => match self.open_identity(&row.sealed) {
                Ok(identity) => identity,
                Err(e) => {
                    error!(
                        "Local identity is unreadable ({}); discarding key material and sessions. \
                         Paired peers must pair again.",
                        e
                    );
                    self.db.wipe_key_material().await?;
                    self.create_identity().await?
                }
            },
            None => self.create_identity().await?,
        };

        let identity = Arc::new(identity);
        *cached = Some(identity.clone());
        Ok(identity)
    }

    fn open_identity(&self, sealed: &SealedBlob) -> Result<IdentityKeyPair> {
        let bytes = self.sealer.open(sealed)?;
        Ok(IdentityKeyPair::from_bytes(&bytes)?)
    }

    async fn create_identity(&self) -> Result<IdentityKeyPair> {
        let identity = IdentityKeyPair::generate()?;
        let sealed = self.sealer.seal(&identity.to_bytes()?)?;
        self.db.save_identity(&sealed).await?;
        info!(
            "Generated local identity {} (registration id {})",
            identity.public().fingerprint(),
            identity.registration_id()
        );
        Ok(identity)
    }

    /// Current prekey bundle: the signed prekey (rotated when stale) plus an
    /// unconsumed one-time prekey. The one-time pool is topped up here.
    pub async fn prekey_bundle(&self) -> Result<PreKeyBundle> {
        let identity = self.identity().await?;
        let _guard = self.prekeys.lock().await;

        let signed = match self.db.latest_signed_prekey().await? {
            Some(key)
                if Utc::now().timestamp() - key.created_at
                    < Duration::days(SIGNED_PREKEY_ROTATION_DAYS).num_seconds() =>
            {
                key
            }
            _ => self.rotate_signed_prekey(&identity).await?,
        };

        let count = self.db.one_time_prekey_count().await?;
        if count < ONE_TIME_PREKEY_LOW_WATER {
            self.replenish_one_time_prekeys(ONE_TIME_PREKEY_POOL - count)
                .await?;
        }

        let one_time_prekey = self
            .db
            .peek_one_time_prekey()
            .await?
            .map(|key| -> Result<OneTimePreKeyPublic> {
                Ok(OneTimePreKeyPublic {
                    id: key.id,
                    key: public_key(&key)?,
                })
            })
            .transpose()?;

        Ok(PreKeyBundle {
            identity: identity.public(),
            signed_prekey_id: signed.id,
            signed_prekey: public_key(&signed)?,
            signed_prekey_signature: signed.signature,
            one_time_prekey,
        })
    }

    async fn rotate_signed_prekey(&self, identity: &IdentityKeyPair) -> Result<StoredPreKey> {
        let pair = DhKeyPair::generate();
        let public = pair.public_bytes();
        let key = StoredPreKey {
            id: self.db.next_counter("signed_prekey").await?,
            public_key: public.to_vec(),
            signature: identity.sign(&public),
            sealed: self.sealer.seal(&pair.secret_bytes()[..])?,
            created_at: Utc::now().timestamp(),
        };
        self.db.insert_signed_prekey(&key).await?;
        self.db.prune_signed_prekeys(SIGNED_PREKEYS_KEPT).await?;
        info!("Rotated signed prekey to id {}", key.id);
        Ok(key)
    }

    async fn replenish_one_time_prekeys(&self, count: usize) -> Result<()> {
        for _ in 0..count {
            let pair = DhKeyPair::generate();
            let key = StoredPreKey {
                id: self.db.next_counter("one_time_prekey").await?,
                public_key: pair.public_bytes().to_vec(),
                signature: Vec::new(),
                sealed: self.sealer.seal(&pair.secret_bytes()[..])?,
                created_at: Utc::now().timestamp(),
            };
            self.db.insert_one_time_prekey(&key).await?;
        }
        debug!("Generated {} one-time prekeys", count);
        Ok(())
    }

    /// Secret half of a signed prekey we still hold
    pub async fn signed_prekey_secret(&self, id: u32) -> Result<Option<DhKeyPair>> {
        match self.db.signed_prekey(id).await? {
            Some(key) => Ok(Some(self.open_prekey(&key)?)),
            None => Ok(None),
        }
    }

    /// Consume a one-time prekey. `None` if it was already consumed.
    pub async fn take_one_time_prekey(&self, id: u32) -> Result<Option<DhKeyPair>> {
        match self.db.take_one_time_prekey(id).await? {
            Some(key) => Ok(Some(self.open_prekey(&key)?)),
            None => Ok(None),
        }
    }

    fn open_prekey(&self, key: &StoredPreKey) -> Result<DhKeyPair> {
        let bytes = self.sealer.open(&key.sealed)?;
        let secret = <[u8; 32]>::try_from(&bytes[..]).map_err(|_| {
            SessionError::Crypto(crate::crypto::CryptoError::InvalidKey(format!(
                "prekey {} has wrong length",
                key.id
            )))
        })?;
        Ok(DhKeyPair::from_secret_bytes(secret))
    }

    /// Load a peer's ratchet session. An unreadable record is dropped.
    pub async fn load_session(&self, peer_id: &str) -> Result<Option<RatchetState>> {
        let Some(row) = self.db.load_session(peer_id).await? else {
            return Ok(None);
        };

        let decoded = self
            .sealer
            .open(&row.sealed)
            .map_err(SessionError::from)
            .and_then(|bytes| {
                serde_json::from_slice::<RatchetState>(&bytes).map_err(|e| {
                    SessionError::BadMessage {
                        peer: peer_id.to_string(),
                        reason: e.to_string(),
                    }
                })
            });

        match decoded {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!("Dropping unreadable session for {}: {}", peer_id, e);
                self.db.delete_session(peer_id).await?;
                Ok(None)
            }
        }
    }

    /// Persist a peer's ratchet session
    pub async fn store_session(&self, peer_id: &str, state: &RatchetState) -> Result<()> {
        let bytes = zeroize::Zeroizing::new(serde_json::to_vec(state).map_err(|e| {
            SessionError::BadMessage {
                peer: peer_id.to_string(),
                reason: e.to_string(),
            }
        })?);
        let sealed = self.sealer.seal(&bytes)?;
        self.db.store_session(peer_id, &sealed).await?;
        Ok(())
    }

    /// Whether a session is stored for the peer
    pub async fn contains_session(&self, peer_id: &str) -> Result<bool> {
        Ok(self.db.contains_session(peer_id).await?)
    }

    /// Delete a peer's session
    pub async fn delete_session(&self, peer_id: &str) -> Result<bool> {
        Ok(self.db.delete_session(peer_id).await?)
    }

    /// Accept `identity` for a peer
    pub async fn trust_identity(&self, peer_id: &str, identity: &IdentityPublic) -> Result<()> {
        self.db.trust_identity(peer_id, &identity.encode()?).await?;
        info!(
            "Trusted identity {} for peer {}",
            identity.fingerprint(),
            peer_id
        );
        Ok(())
    }

    /// Identity accepted for a peer, if any
    pub async fn trusted_identity(&self, peer_id: &str) -> Result<Option<IdentityPublic>> {
        match self.db.trusted_identity(peer_id).await? {
            Some(encoded) => Ok(Some(IdentityPublic::decode(&encoded)?)),
            None => Ok(None),
        }
    }

    /// Forget a peer's identity
    pub async fn remove_trusted_identity(&self, peer_id: &str) -> Result<bool> {
        Ok(self.db.remove_trusted_identity(peer_id).await?)
    }
}

fn public_key(key: &StoredPreKey) -> Result<[u8; 32]> {
    key.public_key.as_slice().try_into().map_err(|_| {
        SessionError::Crypto(crate::crypto::CryptoError::InvalidKey(format!(
            "prekey {} public key has wrong length",
            key.id
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySecretStore;

    async fn store_with(secrets: &MemorySecretStore, db: Arc<Database>) -> SecureSessionStore {
        SecureSessionStore::new(db, secrets).unwrap()
    }

    #[tokio::test]
    async fn test_identity_created_once_and_reloaded() {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let secrets = MemorySecretStore::with_key([3u8; 32]);

        let first = store_with(&secrets, db.clone()).await.identity().await.unwrap();
        let second = store_with(&secrets, db.clone()).await.identity().await.unwrap();
        assert_eq!(first.public(), second.public());
    }

    #[tokio::test]
    async fn test_unreadable_identity_is_replaced() {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let original = store_with(&MemorySecretStore::with_key([1u8; 32]), db.clone()).await;
        let old = original.identity().await.unwrap();
        original.prekey_bundle().await.unwrap();

        let rekeyed = store_with(&MemorySecretStore::with_key([2u8; 32]), db.clone()).await;
        let new = rekeyed.identity().await.unwrap();

        assert_ne!(old.public(), new.public());
        assert_eq!(db.one_time_prekey_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bundle_is_signed_and_pool_filled() {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let store = store_with(&MemorySecretStore::new(), db.clone()).await;

        let bundle = store.prekey_bundle().await.unwrap();
        bundle.verify().unwrap();
        assert!(bundle.one_time_prekey.is_some());
        assert_eq!(
            db.one_time_prekey_count().await.unwrap(),
            ONE_TIME_PREKEY_POOL
        );

        let again = store.prekey_bundle().await.unwrap();
        assert_eq!(again.signed_prekey_id, bundle.signed_prekey_id);
    }

    #[tokio::test]
    async fn test_one_time_prekey_consumed_once() {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let store = store_with(&MemorySecretStore::new(), db).await;
        let bundle = store.prekey_bundle().await.unwrap();
        let id = bundle.one_time_prekey.unwrap().id;

        assert!(store.take_one_time_prekey(id).await.unwrap().is_some());
        assert!(store.take_one_time_prekey(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_trusted_identity_roundtrip() {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let store = store_with(&MemorySecretStore::new(), db).await;
        let peer = IdentityKeyPair::generate().unwrap().public();

        store.trust_identity("peer-a", &peer).await.unwrap();
        assert_eq!(store.trusted_identity("peer-a").await.unwrap(), Some(peer));
        assert!(store.remove_trusted_identity("peer-a").await.unwrap());
        assert!(store.trusted_identity("peer-a").await.unwrap().is_none());
    }
}
