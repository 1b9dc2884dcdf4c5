//! SQLite database wrapper shared by every store

use crate::storage::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA_VERSION: u32 = 1;

/// SQLite database holding identity, session, peer and task state
pub struct Database {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open (or create) the database at `path`
    pub async fn open(path: &Path) -> Result<Self> {
        // Create directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.initialize().await?;
        Ok(db)
    }

    /// Open a throwaway in-memory database
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.initialize().await?;
        Ok(db)
    }

    pub(crate) async fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    async fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock().await;

        let version = Self::schema_version(&conn)?;
        if version == 0 {
            Self::create_schema(&conn)?;
        } else if version < SCHEMA_VERSION {
            Self::migrate_schema(&conn, version)?;
        }

        Ok(())
    }

    fn schema_version(conn: &Connection) -> Result<u32> {
        let table_exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            [],
            |row| row.get(0),
        )?;

        if !table_exists {
            return Ok(0);
        }

        let version: Option<u32> = conn
            .query_row(
                "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        Ok(version.unwrap_or(0))
    }

    fn create_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER DEFAULT (strftime('%s', 'now'))
            );

            CREATE TABLE IF NOT EXISTS local_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS local_identity (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                sealed BLOB NOT NULL,
                nonce BLOB NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS signed_prekeys (
                id INTEGER PRIMARY KEY,
                public_key BLOB NOT NULL,
                signature BLOB NOT NULL,
                sealed BLOB NOT NULL,
                nonce BLOB NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS one_time_prekeys (
                id INTEGER PRIMARY KEY,
                public_key BLOB NOT NULL,
                sealed BLOB NOT NULL,
                nonce BLOB NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                peer_id TEXT PRIMARY KEY,
                sealed BLOB NOT NULL,
                nonce BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS trusted_identities (
                peer_id TEXT PRIMARY KEY,
                identity TEXT NOT NULL,
                trusted_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS peer_runtime (
                instance_id TEXT PRIMARY KEY,
                info TEXT NOT NULL,
                modified_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS blacklist (
                instance_id TEXT PRIMARY KEY,
                added_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                task_type TEXT NOT NULL,
                status TEXT NOT NULL,
                history TEXT NOT NULL,
                extra TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                modified_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            ",
        )?;

        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?)",
            params![SCHEMA_VERSION],
        )?;

        Ok(())
    }

    fn migrate_schema(_conn: &Connection, _from_version: u32) -> Result<()> {
        // Future migrations would go here
        Ok(())
    }

    /// Return the stable instance id of this installation, creating it once
    pub async fn instance_id(&self) -> Result<String> {
        let conn = self.conn.lock().await;
        let existing: Option<String> = conn
            .query_row(
                "SELECT value FROM local_meta WHERE key = 'instance_id'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            return Ok(id);
        }

        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO local_meta (key, value) VALUES ('instance_id', ?)",
            params![id],
        )?;
        tracing::info!("Generated new instance id {}", id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_instance_id_is_stable_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sync.db");

        let first = {
            let db = Database::open(&path).await.unwrap();
            db.instance_id().await.unwrap()
        };
        let db = Database::open(&path).await.unwrap();
        assert_eq!(db.instance_id().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_schema_created_once() {
        let db = Database::open_in_memory().await.unwrap();
        db.initialize().await.unwrap();
        let conn = db.conn().await;
        assert_eq!(Database::schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }
}
