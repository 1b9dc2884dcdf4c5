//! Identity, prekey, session and trust rows

use super::{Database, Result, SealedBlob};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

/// A sealed blob with the time it was written
#[derive(Debug, Clone)]
pub struct SealedRow {
    /// Sealed payload
    pub sealed: SealedBlob,
    /// Unix timestamp of the write
    pub timestamp: i64,
}

/// A signed or one-time prekey as stored on disk
#[derive(Debug, Clone)]
pub struct StoredPreKey {
    /// Prekey id, unique within its table
    pub id: u32,
    /// X25519 public key
    pub public_key: Vec<u8>,
    /// Ed25519 signature over the public key (empty for one-time prekeys)
    pub signature: Vec<u8>,
    /// Sealed X25519 secret
    pub sealed: SealedBlob,
    /// Unix timestamp of creation
    pub created_at: i64,
}

fn sealed_row(row: &Row<'_>) -> rusqlite::Result<SealedRow> {
    Ok(SealedRow {
        sealed: SealedBlob {
            ciphertext: row.get(0)?,
            nonce: row.get(1)?,
        },
        timestamp: row.get(2)?,
    })
}

fn signed_prekey_row(row: &Row<'_>) -> rusqlite::Result<StoredPreKey> {
    Ok(StoredPreKey {
        id: row.get(0)?,
        public_key: row.get(1)?,
        signature: row.get(2)?,
        sealed: SealedBlob {
            ciphertext: row.get(3)?,
            nonce: row.get(4)?,
        },
        created_at: row.get(5)?,
    })
}

fn one_time_prekey_row(row: &Row<'_>) -> rusqlite::Result<StoredPreKey> {
    Ok(StoredPreKey {
        id: row.get(0)?,
        public_key: row.get(1)?,
        signature: Vec::new(),
        sealed: SealedBlob {
            ciphertext: row.get(2)?,
            nonce: row.get(3)?,
        },
        created_at: row.get(4)?,
    })
}

impl Database {
    /// Allocate the next value of a monotonically increasing counter
    pub async fn next_counter(&self, name: &str) -> Result<u32> {
        let mut conn = self.conn().await;
        let tx = conn.transaction()?;
        let key = format!("counter:{}", name);
        let current: Option<String> = tx
            .query_row(
                "SELECT value FROM local_meta WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        let next = current.and_then(|v| v.parse::<u32>().ok()).unwrap_or(0) + 1;
        tx.execute(
            "INSERT OR REPLACE INTO local_meta (key, value) VALUES (?, ?)",
            params![key, next.to_string()],
        )?;
        tx.commit()?;
        Ok(next)
    }

    /// Load the sealed local identity
    pub async fn load_identity(&self) -> Result<Option<SealedRow>> {
        let conn = self.conn().await;
        let row = conn
            .query_row(
                "SELECT sealed, nonce, created_at FROM local_identity WHERE id = 1",
                [],
                sealed_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Persist the sealed local identity, replacing any previous one
    pub async fn save_identity(&self, sealed: &SealedBlob) -> Result<()> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT OR REPLACE INTO local_identity (id, sealed, nonce, created_at) VALUES (1, ?, ?, ?)",
            params![sealed.ciphertext, sealed.nonce, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    /// Discard the identity, every prekey and every session
    pub async fn wipe_key_material(&self) -> Result<()> {
        let mut conn = self.conn().await;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM local_identity", [])?;
        tx.execute("DELETE FROM signed_prekeys", [])?;
        tx.execute("DELETE FROM one_time_prekeys", [])?;
        tx.execute("DELETE FROM sessions", [])?;
        tx.commit()?;
        Ok(())
    }

    /// Store a signed prekey
    pub async fn insert_signed_prekey(&self, key: &StoredPreKey) -> Result<()> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO signed_prekeys (id, public_key, signature, sealed, nonce, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                key.id,
                key.public_key,
                key.signature,
                key.sealed.ciphertext,
                key.sealed.nonce,
                key.created_at
            ],
        )?;
        Ok(())
    }

    /// Most recently created signed prekey
    pub async fn latest_signed_prekey(&self) -> Result<Option<StoredPreKey>> {
        let conn = self.conn().await;
        let key = conn
            .query_row(
                "SELECT id, public_key, signature, sealed, nonce, created_at
                 FROM signed_prekeys ORDER BY id DESC LIMIT 1",
                [],
                signed_prekey_row,
            )
            .optional()?;
        Ok(key)
    }

    /// Signed prekey by id
    pub async fn signed_prekey(&self, id: u32) -> Result<Option<StoredPreKey>> {
        let conn = self.conn().await;
        let key = conn
            .query_row(
                "SELECT id, public_key, signature, sealed, nonce, created_at
                 FROM signed_prekeys WHERE id = ?",
                params![id],
                signed_prekey_row,
            )
            .optional()?;
        Ok(key)
    }

    /// Keep only the `keep` newest signed prekeys
    pub async fn prune_signed_prekeys(&self, keep: usize) -> Result<usize> {
        let conn = self.conn().await;
        let removed = conn.execute(
            "DELETE FROM signed_prekeys WHERE id NOT IN
             (SELECT id FROM signed_prekeys ORDER BY id DESC LIMIT ?)",
            params![keep as i64],
        )?;
        Ok(removed)
    }

    /// Store a one-time prekey
    pub async fn insert_one_time_prekey(&self, key: &StoredPreKey) -> Result<()> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO one_time_prekeys (id, public_key, sealed, nonce, created_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                key.id,
                key.public_key,
                key.sealed.ciphertext,
                key.sealed.nonce,
                key.created_at
            ],
        )?;
        Ok(())
    }

    /// Number of unconsumed one-time prekeys
    pub async fn one_time_prekey_count(&self) -> Result<usize> {
        let conn = self.conn().await;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM one_time_prekeys", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Oldest unconsumed one-time prekey, left in place
    pub async fn peek_one_time_prekey(&self) -> Result<Option<StoredPreKey>> {
        let conn = self.conn().await;
        let key = conn
            .query_row(
                "SELECT id, public_key, sealed, nonce, created_at
                 FROM one_time_prekeys ORDER BY id ASC LIMIT 1",
                [],
                one_time_prekey_row,
            )
            .optional()?;
        Ok(key)
    }

    /// Remove and return a one-time prekey. `None` once it has been consumed.
    pub async fn take_one_time_prekey(&self, id: u32) -> Result<Option<StoredPreKey>> {
        let mut conn = self.conn().await;
        let tx = conn.transaction()?;
        let key = tx
            .query_row(
                "SELECT id, public_key, sealed, nonce, created_at
                 FROM one_time_prekeys WHERE id = ?",
                params![id],
                one_time_prekey_row,
            )
            .optional()?;
        if key.is_some() {
            tx.execute("DELETE FROM one_time_prekeys WHERE id = ?", params![id])?;
        }
        tx.commit()?;
        Ok(key)
    }

    /// Load the sealed ratchet session for a peer
    pub async fn load_session(&self, peer_id: &str) -> Result<Option<SealedRow>> {
        let conn = self.conn().await;
        let row = conn
            .query_row(
                "SELECT sealed, nonce, updated_at FROM sessions WHERE peer_id = ?",
                params![peer_id],
                sealed_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Persist the sealed ratchet session for a peer
    pub async fn store_session(&self, peer_id: &str, sealed: &SealedBlob) -> Result<()> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT OR REPLACE INTO sessions (peer_id, sealed, nonce, updated_at) VALUES (?, ?, ?, ?)",
            params![
                peer_id,
                sealed.ciphertext,
                sealed.nonce,
                Utc::now().timestamp()
            ],
        )?;
        Ok(())
    }

    /// Delete a peer's session. Returns whether one existed.
    pub async fn delete_session(&self, peer_id: &str) -> Result<bool> {
        let conn = self.conn().await;
        let removed = conn.execute("DELETE FROM sessions WHERE peer_id = ?", params![peer_id])?;
        Ok(removed > 0)
    }

    /// Whether a session row exists for the peer
    pub async fn contains_session(&self, peer_id: &str) -> Result<bool> {
        let conn = self.conn().await;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sessions WHERE peer_id = ?)",
            params![peer_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Record the identity accepted for a peer through pairing
    pub async fn trust_identity(&self, peer_id: &str, identity: &str) -> Result<()> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT OR REPLACE INTO trusted_identities (peer_id, identity, trusted_at) VALUES (?, ?, ?)",
            params![peer_id, identity, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    /// Identity previously accepted for a peer
    pub async fn trusted_identity(&self, peer_id: &str) -> Result<Option<String>> {
        let conn = self.conn().await;
        let identity = conn
            .query_row(
                "SELECT identity FROM trusted_identities WHERE peer_id = ?",
                params![peer_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(identity)
    }

    /// Forget a peer's trusted identity
    pub async fn remove_trusted_identity(&self, peer_id: &str) -> Result<bool> {
        let conn = self.conn().await;
        let removed = conn.execute(
            "DELETE FROM trusted_identities WHERE peer_id = ?",
            params![peer_id],
        )?;
        Ok(removed > 0)
    }
}
