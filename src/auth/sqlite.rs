//! SQLite credential store
//!
//! Shares the database file with the record store, so every process pointed
//! at the same file sees the same revocations, and they survive restarts.
//! Both tables are keyed by token id; lookups are primary-key probes.

use super::revocation::{CredentialStore, IssuedEntry, RevocationEntry};
use crate::error::Result;
use crate::store::run_blocking;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS issued_tokens (
    token_id   TEXT PRIMARY KEY,
    subject    TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS revoked_tokens (
    token_id   TEXT PRIMARY KEY,
    revoked_at INTEGER NOT NULL,
    ttl_secs   INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);
";

pub struct SqliteCredentialStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCredentialStore {
    /// Open (or create) a database file and apply the schema
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "Opened SQLite credential store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn record_issued(&self, entry: IssuedEntry) -> Result<()> {
        run_blocking(&self.conn, move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO issued_tokens (token_id, subject, expires_at) \
                 VALUES (?1, ?2, ?3)",
                params![entry.token_id, entry.subject, entry.expires_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn issued(&self, token_id: &str, now: i64) -> Result<Option<IssuedEntry>> {
        let token_id = token_id.to_string();
        run_blocking(&self.conn, move |conn| {
            let entry = conn
                .query_row(
                    "SELECT token_id, subject, expires_at FROM issued_tokens \
                     WHERE token_id = ?1 AND expires_at > ?2",
                    params![token_id, now],
                    |row| {
                        Ok(IssuedEntry {
                            token_id: row.get(0)?,
                            subject: row.get(1)?,
                            expires_at: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(entry)
        })
        .await
    }

    async fn revoke(&self, entry: RevocationEntry) -> Result<()> {
        run_blocking(&self.conn, move |conn| {
            // Keep whichever entry expires last
            conn.execute(
                "INSERT INTO revoked_tokens (token_id, revoked_at, ttl_secs, expires_at) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT (token_id) DO UPDATE SET \
                     revoked_at = excluded.revoked_at, \
                     ttl_secs = excluded.ttl_secs, \
                     expires_at = excluded.expires_at \
                 WHERE excluded.expires_at > revoked_tokens.expires_at",
                params![
                    entry.token_id,
                    entry.revoked_at,
                    entry.ttl_secs as i64,
                    entry.expires_at()
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn is_revoked(&self, token_id: &str, now: i64) -> Result<bool> {
        let token_id = token_id.to_string();
        run_blocking(&self.conn, move |conn| {
            let expires_at: Option<i64> = conn
                .query_row(
                    "SELECT expires_at FROM revoked_tokens WHERE token_id = ?1",
                    params![token_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(expires_at.map(|at| at > now).unwrap_or(false))
        })
        .await
    }

    async fn evict_expired(&self, now: i64) -> Result<usize> {
        let removed = run_blocking(&self.conn, move |conn| {
            let issued = conn.execute(
                "DELETE FROM issued_tokens WHERE expires_at <= ?1",
                params![now],
            )?;
            let revoked = conn.execute(
                "DELETE FROM revoked_tokens WHERE expires_at <= ?1",
                params![now],
            )?;
            Ok(issued + revoked)
        })
        .await?;
        if removed > 0 {
            tracing::debug!(removed, "Evicted expired credential entries");
        }
        Ok(removed)
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}
