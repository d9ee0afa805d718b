#![allow(clippy::missing_errors_doc)]

//! SQLite backing stores for popup state.
//!
//! One database file stands in for a browser profile. The `durable`
//! namespace plays the role of `localStorage`; every `session:<id>` namespace
//! plays the role of one `sessionStorage`, so a new session id is a new
//! browser session.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use popup_gate_core::{KeyValueStore, StoreError};
use rusqlite::{params, Connection, OptionalExtension};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

pub const DURABLE_NAMESPACE: &str = "durable";

const POPUP_STATE_MIGRATION_VERSION: i64 = 1;

const SCHEMA_POPUP_STATE_V1: &str = r"
CREATE TABLE IF NOT EXISTS popup_state (
  namespace TEXT NOT NULL CHECK (length(namespace) > 0),
  key TEXT NOT NULL CHECK (length(key) > 0),
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (namespace, key)
);

CREATE INDEX IF NOT EXISTS idx_popup_state_updated
  ON popup_state(namespace, updated_at);
";

#[must_use]
pub fn session_namespace(session_id: &str) -> String {
    format!("session:{session_id}")
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct StoredEntry {
    pub key: String,
    pub value: String,
    pub updated_at: String,
}

pub struct SqliteKeyValueStore {
    conn: Connection,
    namespace: String,
}

impl SqliteKeyValueStore {
    pub fn open(path: &Path, namespace: &str) -> Result<Self> {
        if namespace.trim().is_empty() {
            return Err(anyhow!("store namespace MUST be non-empty"));
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            namespace: namespace.to_string(),
        })
    }

    /// Opens and migrates the visitor-lifetime store.
    pub fn open_durable(path: &Path) -> Result<Self> {
        let store = Self::open(path, DURABLE_NAMESPACE)?;
        store.migrate()?;
        Ok(store)
    }

    /// Opens and migrates the store of browser session `session_id`.
    pub fn open_session(path: &Path, session_id: &str) -> Result<Self> {
        if session_id.trim().is_empty() {
            return Err(anyhow!("session id MUST be non-empty"));
        }
        let store = Self::open(path, &session_namespace(session_id))?;
        store.migrate()?;
        Ok(store)
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_POPUP_STATE_V1)
            .context("failed to apply popup state schema")?;

        let now = now_rfc3339()?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![POPUP_STATE_MIGRATION_VERSION, now],
            )
            .context("failed to register popup state schema migration")?;

        Ok(())
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn read(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM popup_state WHERE namespace = ?1 AND key = ?2",
                params![self.namespace, key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to read popup state key {key}"))
    }

    pub fn write(&self, key: &str, value: &str) -> Result<()> {
        let now = now_rfc3339()?;
        self.conn
            .execute(
                "INSERT INTO popup_state(namespace, key, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(namespace, key) DO UPDATE SET
                   value = excluded.value,
                   updated_at = excluded.updated_at",
                params![self.namespace, key, value, now],
            )
            .with_context(|| format!("failed to write popup state key {key}"))?;
        debug!(namespace = %self.namespace, key, "popup state written");
        Ok(())
    }

    /// Entries of this namespace ordered by key.
    pub fn entries(&self) -> Result<Vec<StoredEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT key, value, updated_at FROM popup_state
                 WHERE namespace = ?1
                 ORDER BY key ASC",
            )
            .context("failed to prepare popup state listing")?;

        let rows = stmt
            .query_map(params![self.namespace], |row| {
                Ok(StoredEntry {
                    key: row.get(0)?,
                    value: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            })
            .context("failed to list popup state")?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.context("failed to decode popup state row")?);
        }
        Ok(entries)
    }

    /// Forgets every entry of this namespace, like clearing site data.
    pub fn clear_namespace(&self) -> Result<usize> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM popup_state WHERE namespace = ?1",
                params![self.namespace],
            )
            .with_context(|| format!("failed to clear namespace {}", self.namespace))?;
        debug!(namespace = %self.namespace, removed, "popup state cleared");
        Ok(removed)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.read(key)
            .map_err(|err| StoreError::Unavailable(format!("{err:#}")))
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.write(key, value)
            .map_err(|err| StoreError::Unavailable(format!("{err:#}")))
    }
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(|err| anyhow!("failed to format RFC3339 timestamp: {err}"))
}
