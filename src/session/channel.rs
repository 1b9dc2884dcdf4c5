//! Per-peer encrypted channel over Double Ratchet sessions

use super::{x3dh, Result, SecureSessionStore, SessionError};
use crate::crypto::{b64, IdentityPublic, PreKeyBundle, RatchetMessage, RatchetState};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// First message of a session, carrying the key agreement inputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapMessage {
    /// Initiator identity
    pub identity: IdentityPublic,
    /// Initiator ephemeral key
    #[serde(with = "b64")]
    pub ephemeral_key: [u8; 32],
    /// Responder signed prekey the agreement used
    pub signed_prekey_id: u32,
    /// Responder one-time prekey the agreement used
    pub one_time_prekey_id: u32,
    /// First ratchet message
    pub message: RatchetMessage,
}

/// Initiator session built from a bundle, not yet accepted by the peer
#[derive(Debug)]
pub struct PendingSession {
    state: RatchetState,
    remote_identity: IdentityPublic,
}

impl PendingSession {
    /// Identity from the bundle the session was built against
    pub fn remote_identity(&self) -> &IdentityPublic {
        &self.remote_identity
    }
}

type Slot = Arc<Mutex<Option<RatchetState>>>;

/// Encrypt/decrypt per peer. Operations on one peer are serialized; the
/// stored record is written before the cached state changes.
pub struct SecureChannel {
    store: Arc<SecureSessionStore>,
    sessions: DashMap<String, Slot>,
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("cached_sessions", &self.sessions.len())
            .finish()
    }
}

impl SecureChannel {
    /// Create a channel over `store`
    pub fn new(store: Arc<SecureSessionStore>) -> Self {
        Self {
            store,
            sessions: DashMap::new(),
        }
    }

    /// Underlying session store
    pub fn store(&self) -> &Arc<SecureSessionStore> {
        &self.store
    }

    fn slot(&self, peer_id: &str) -> Slot {
        self.sessions
            .entry(peer_id.to_string())
            .or_insert_with(Slot::default)
            .value()
            .clone()
    }

    async fn load_into(&self, peer_id: &str, slot: &mut Option<RatchetState>) -> Result<()> {
        if slot.is_none() {
            *slot = self.store.load_session(peer_id).await?;
        }
        Ok(())
    }

    /// Encrypt for an established session
    pub async fn encrypt(&self, peer_id: &str, plaintext: &[u8]) -> Result<RatchetMessage> {
        let slot = self.slot(peer_id);
        let mut guard = slot.lock().await;
        self.load_into(peer_id, &mut guard).await?;

        let mut next = guard
            .as_ref()
            .ok_or_else(|| SessionError::NoSession(peer_id.to_string()))?
            .clone();
        let message = next.encrypt(plaintext)?;

        self.store.store_session(peer_id, &next).await?;
        *guard = Some(next);
        Ok(message)
    }

    /// Decrypt a steady-state message. A failure leaves the session untouched.
    pub async fn decrypt(&self, peer_id: &str, message: &RatchetMessage) -> Result<Vec<u8>> {
        let slot = self.slot(peer_id);
        let mut guard = slot.lock().await;
        self.load_into(peer_id, &mut guard).await?;

        let mut next = guard
            .as_ref()
            .ok_or_else(|| SessionError::NoSession(peer_id.to_string()))?
            .clone();
        let plaintext = next.decrypt(message).map_err(|e| SessionError::BadMessage {
            peer: peer_id.to_string(),
            reason: e.to_string(),
        })?;

        self.store.store_session(peer_id, &next).await?;
        *guard = Some(next);
        Ok(plaintext)
    }

    /// Accept a bootstrap message from a trusted peer, replacing any session
    pub async fn decrypt_bootstrap(
        &self,
        peer_id: &str,
        bootstrap: &BootstrapMessage,
    ) -> Result<Vec<u8>> {
        match self.store.trusted_identity(peer_id).await? {
            Some(trusted) if trusted == bootstrap.identity => {}
            _ => return Err(SessionError::UntrustedIdentity(peer_id.to_string())),
        }

        let local = self.store.identity().await?;
        let signed_prekey = self
            .store
            .signed_prekey_secret(bootstrap.signed_prekey_id)
            .await?
            .ok_or(SessionError::UnknownPreKey(bootstrap.signed_prekey_id))?;
        let one_time_prekey = self
            .store
            .take_one_time_prekey(bootstrap.one_time_prekey_id)
            .await?
            .ok_or(SessionError::PreKeyConsumed(bootstrap.one_time_prekey_id))?;

        let secret = x3dh::respond(
            &local,
            &signed_prekey,
            &one_time_prekey,
            &bootstrap.identity,
            &bootstrap.ephemeral_key,
        );
        let mut state = RatchetState::responder(
            &secret,
            &signed_prekey,
            x3dh::associated_data(&bootstrap.identity, &local.public()),
        );
        let plaintext = state
            .decrypt(&bootstrap.message)
            .map_err(|e| SessionError::BadMessage {
                peer: peer_id.to_string(),
                reason: e.to_string(),
            })?;

        let slot = self.slot(peer_id);
        let mut guard = slot.lock().await;
        self.store.store_session(peer_id, &state).await?;
        *guard = Some(state);
        info!("Established session with {} as responder", peer_id);
        Ok(plaintext)
    }

    /// Build a session from a peer's bundle. Nothing is stored until
    /// [`SecureChannel::commit`].
    pub async fn initiate(
        &self,
        peer_id: &str,
        bundle: &PreKeyBundle,
        payload: &[u8],
    ) -> Result<(PendingSession, BootstrapMessage)> {
        let local = self.store.identity().await?;
        let agreement = x3dh::initiate(&local, bundle)?;

        let mut state = RatchetState::initiator(
            &agreement.shared_secret,
            bundle.signed_prekey,
            x3dh::associated_data(&local.public(), &bundle.identity),
        );
        let message = state.encrypt(payload)?;
        debug!("Prepared bootstrap for {}", peer_id);

        let bootstrap = BootstrapMessage {
            identity: local.public(),
            ephemeral_key: agreement.ephemeral_public,
            signed_prekey_id: bundle.signed_prekey_id,
            one_time_prekey_id: agreement.one_time_prekey_id,
            message,
        };
        let pending = PendingSession {
            state,
            remote_identity: bundle.identity.clone(),
        };
        Ok((pending, bootstrap))
    }

    /// Store a session the peer accepted
    pub async fn commit(&self, peer_id: &str, pending: PendingSession) -> Result<()> {
        let slot = self.slot(peer_id);
        let mut guard = slot.lock().await;
        self.store.store_session(peer_id, &pending.state).await?;
        *guard = Some(pending.state);
        info!("Established session with {} as initiator", peer_id);
        Ok(())
    }

    /// Whether a session exists for the peer
    pub async fn has_session(&self, peer_id: &str) -> Result<bool> {
        let cached = self.sessions.get(peer_id).map(|slot| slot.value().clone());
        if let Some(slot) = cached {
            if slot.lock().await.is_some() {
                return Ok(true);
            }
        }
        self.store.contains_session(peer_id).await
    }

    /// Drop the stored and cached session for a peer
    pub async fn remove_session(&self, peer_id: &str) -> Result<()> {
        let slot = self.slot(peer_id);
        let mut guard = slot.lock().await;
        self.store.delete_session(peer_id).await?;
        *guard = None;
        drop(guard);
        self.sessions.remove(peer_id);
        debug!("Removed session with {}", peer_id);
        Ok(())
    }
}
