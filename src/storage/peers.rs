//! Peer runtime records and the blacklist

use super::{Database, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};

impl Database {
    /// Write a peer's runtime record
    pub async fn save_peer<T: Serialize>(&self, instance_id: &str, info: &T) -> Result<()> {
        let json = serde_json::to_string(info)?;
        let conn = self.conn().await;
        conn.execute(
            "INSERT OR REPLACE INTO peer_runtime (instance_id, info, modified_at) VALUES (?, ?, ?)",
            params![instance_id, json, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Read a peer's runtime record
    pub async fn load_peer<T: DeserializeOwned>(&self, instance_id: &str) -> Result<Option<T>> {
        let conn = self.conn().await;
        let json: Option<String> = conn
            .query_row(
                "SELECT info FROM peer_runtime WHERE instance_id = ?",
                params![instance_id],
                |row| row.get(0),
            )
            .optional()?;
        drop(conn);

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Every stored peer record. Rows that fail to decode are skipped.
    pub async fn list_peers<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let conn = self.conn().await;
        let mut stmt =
            conn.prepare("SELECT instance_id, info FROM peer_runtime ORDER BY instance_id")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut peers = Vec::with_capacity(rows.len());
        for (id, json) in rows {
            match serde_json::from_str(&json) {
                Ok(peer) => peers.push(peer),
                Err(e) => tracing::warn!("Skipping corrupt peer record {}: {}", id, e),
            }
        }
        Ok(peers)
    }

    /// Delete a peer's runtime record
    pub async fn delete_peer(&self, instance_id: &str) -> Result<bool> {
        let conn = self.conn().await;
        let removed = conn.execute(
            "DELETE FROM peer_runtime WHERE instance_id = ?",
            params![instance_id],
        )?;
        Ok(removed > 0)
    }

    /// Add an instance to the blacklist
    pub async fn block(&self, instance_id: &str) -> Result<()> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT OR IGNORE INTO blacklist (instance_id, added_at) VALUES (?, ?)",
            params![instance_id, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    /// Remove an instance from the blacklist
    pub async fn unblock(&self, instance_id: &str) -> Result<bool> {
        let conn = self.conn().await;
        let removed = conn.execute(
            "DELETE FROM blacklist WHERE instance_id = ?",
            params![instance_id],
        )?;
        Ok(removed > 0)
    }

    /// All blacklisted instance ids
    pub async fn blacklist(&self) -> Result<Vec<String>> {
        let conn = self.conn().await;
        let mut stmt = conn.prepare("SELECT instance_id FROM blacklist ORDER BY instance_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }
}
