//! Double Ratchet
//!
//! A DH ratchet over X25519 for break-in recovery plus symmetric chain keys
//! for forward secrecy. The state is plain data so a session can be cloned,
//! advanced and only written back once an operation fully succeeds.

use super::keys::DhKeyPair;
use super::{b64, kdf, CryptoError};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// Upper bound on message keys derived ahead in a single step
const MAX_SKIP: u32 = 256;

/// Upper bound on message keys kept for late messages
const MAX_STORED_SKIPPED: usize = 512;

const ROOT_INFO: &[u8] = b"ClipMesh_Ratchet";
const MESSAGE_INFO: &[u8] = b"ClipMesh_MessageKeys";

/// Cleartext header sent with every ratchet message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Sender's current ratchet public key
    #[serde(with = "b64")]
    pub dh_public: [u8; 32],
    /// Length of the sender's previous sending chain
    pub previous_chain_length: u32,
    /// Index within the current sending chain
    pub message_index: u32,
}

impl MessageHeader {
    fn to_bytes(self) -> [u8; 40] {
        let mut out = [0u8; 40];
        out[..32].copy_from_slice(&self.dh_public);
        out[32..36].copy_from_slice(&self.previous_chain_length.to_be_bytes());
        out[36..].copy_from_slice(&self.message_index.to_be_bytes());
        out
    }
}

/// An encrypted ratchet message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetMessage {
    /// Message header, authenticated but not encrypted
    pub header: MessageHeader,
    /// AES-256-GCM ciphertext
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
}

#[derive(Clone, Serialize, Deserialize)]
struct SkippedKey {
    dh_public: [u8; 32],
    index: u32,
    key: [u8; 32],
}

/// Per-peer ratchet state
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetState {
    root_key: [u8; 32],
    dh_secret: [u8; 32],
    remote_dh: Option<[u8; 32]>,
    send_chain: Option<[u8; 32]>,
    recv_chain: Option<[u8; 32]>,
    send_index: u32,
    recv_index: u32,
    previous_send_length: u32,
    skipped: Vec<SkippedKey>,
    associated_data: Vec<u8>,
}

impl std::fmt::Debug for RatchetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetState")
            .field("send_index", &self.send_index)
            .field("recv_index", &self.recv_index)
            .field("skipped", &self.skipped.len())
            .finish_non_exhaustive()
    }
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.dh_secret.zeroize();
        if let Some(key) = self.send_chain.as_mut() {
            key.zeroize();
        }
        if let Some(key) = self.recv_chain.as_mut() {
            key.zeroize();
        }
        for skipped in self.skipped.iter_mut() {
            skipped.key.zeroize();
        }
    }
}

impl RatchetState {
    /// Initiator state after key agreement. `remote_ratchet_key` is the
    /// responder's signed prekey.
    pub fn initiator(
        shared_secret: &[u8; 32],
        remote_ratchet_key: [u8; 32],
        associated_data: Vec<u8>,
    ) -> Self {
        let ours = DhKeyPair::generate();
        let dh = ours.diffie_hellman(&remote_ratchet_key);
        let (root_key, send_chain) = kdf::derive_pair(Some(&shared_secret[..]), &dh[..], ROOT_INFO);

        Self {
            root_key,
            dh_secret: *ours.secret_bytes(),
            remote_dh: Some(remote_ratchet_key),
            send_chain: Some(send_chain),
            recv_chain: None,
            send_index: 0,
            recv_index: 0,
            previous_send_length: 0,
            skipped: Vec::new(),
            associated_data,
        }
    }

    /// Responder state after key agreement. `ours` is the signed prekey pair
    /// the initiator ratcheted against.
    pub fn responder(shared_secret: &[u8; 32], ours: &DhKeyPair, associated_data: Vec<u8>) -> Self {
        Self {
            root_key: *shared_secret,
            dh_secret: *ours.secret_bytes(),
            remote_dh: None,
            send_chain: None,
            recv_chain: None,
            send_index: 0,
            recv_index: 0,
            previous_send_length: 0,
            skipped: Vec::new(),
            associated_data,
        }
    }

    /// Whether this side may send yet
    pub fn can_send(&self) -> bool {
        self.send_chain.is_some()
    }

    /// Encrypt `plaintext`, advancing the sending chain
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetMessage, CryptoError> {
        let chain = self.send_chain.ok_or(CryptoError::NoSendingChain)?;
        let (mut message_key, next_chain) = kdf::chain_step(&chain);

        let header = MessageHeader {
            dh_public: DhKeyPair::from_secret_bytes(self.dh_secret).public_bytes(),
            previous_chain_length: self.previous_send_length,
            message_index: self.send_index,
        };
        let ciphertext = seal(&message_key, &self.aad(&header), plaintext);
        message_key.zeroize();

        self.send_chain = Some(next_chain);
        self.send_index += 1;

        Ok(RatchetMessage {
            header,
            ciphertext: ciphertext?,
        })
    }

    /// Decrypt `message`, advancing the receiving side. On error the state
    /// may be partially advanced; callers decrypt on a clone.
    pub fn decrypt(&mut self, message: &RatchetMessage) -> Result<Vec<u8>, CryptoError> {
        let header = message.header;
        let aad = self.aad(&header);

        if let Some(pos) = self
            .skipped
            .iter()
            .position(|s| s.dh_public == header.dh_public && s.index == header.message_index)
        {
            let skipped = self.skipped.remove(pos);
            return open(&skipped.key, &aad, &message.ciphertext);
        }

        if self.remote_dh != Some(header.dh_public) {
            self.skip_until(header.previous_chain_length)?;
            self.dh_step(header.dh_public);
        }

        if header.message_index < self.recv_index {
            return Err(CryptoError::Duplicate);
        }
        self.skip_until(header.message_index)?;

        let chain = self.recv_chain.ok_or(CryptoError::Decrypt)?;
        let (mut message_key, next_chain) = kdf::chain_step(&chain);
        let plaintext = open(&message_key, &aad, &message.ciphertext);
        message_key.zeroize();

        self.recv_chain = Some(next_chain);
        self.recv_index += 1;
        plaintext
    }

    fn aad(&self, header: &MessageHeader) -> Vec<u8> {
        let mut aad = self.associated_data.clone();
        aad.extend_from_slice(&header.to_bytes());
        aad
    }

    fn skip_until(&mut self, until: u32) -> Result<(), CryptoError> {
        let (Some(mut chain), Some(remote)) = (self.recv_chain, self.remote_dh) else {
            return Ok(());
        };
        if until <= self.recv_index {
            return Ok(());
        }
        if until - self.recv_index > MAX_SKIP {
            return Err(CryptoError::TooManySkipped);
        }

        while self.recv_index < until {
            let (message_key, next_chain) = kdf::chain_step(&chain);
            self.skipped.push(SkippedKey {
                dh_public: remote,
                index: self.recv_index,
                key: message_key,
            });
            chain = next_chain;
            self.recv_index += 1;
        }
        self.recv_chain = Some(chain);

        if self.skipped.len() > MAX_STORED_SKIPPED {
            let excess = self.skipped.len() - MAX_STORED_SKIPPED;
            self.skipped.drain(..excess);
        }
        Ok(())
    }

    fn dh_step(&mut self, remote: [u8; 32]) {
        self.previous_send_length = self.send_index;
        self.send_index = 0;
        self.recv_index = 0;
        self.remote_dh = Some(remote);

        let current = DhKeyPair::from_secret_bytes(self.dh_secret);
        let dh = current.diffie_hellman(&remote);
        let (root_key, recv_chain) = kdf::derive_pair(Some(&self.root_key[..]), &dh[..], ROOT_INFO);
        self.root_key = root_key;
        self.recv_chain = Some(recv_chain);

        let next = DhKeyPair::generate();
        let dh = next.diffie_hellman(&remote);
        let (root_key, send_chain) = kdf::derive_pair(Some(&self.root_key[..]), &dh[..], ROOT_INFO);
        self.root_key = root_key;
        self.send_chain = Some(send_chain);
        self.dh_secret = *next.secret_bytes();
    }
}

fn message_cipher(message_key: &[u8; 32]) -> Result<(Aes256Gcm, [u8; 12]), CryptoError> {
    let mut okm: [u8; 44] = kdf::derive(None, message_key, MESSAGE_INFO);
    let cipher = Aes256Gcm::new_from_slice(&okm[..32]).map_err(|_| CryptoError::Encrypt)?;
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok((cipher, nonce))
}

fn seal(message_key: &[u8; 32], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let (cipher, nonce) = message_cipher(message_key)?;
    cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Encrypt)
}

fn open(message_key: &[u8; 32], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let (cipher, nonce) = message_cipher(message_key)?;
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decrypt)
}
