//! Transactional document store port
//!
//! Every state mutation in the engines is one atomic batch commit in which
//! each write carries a precondition on the document revision it read. A
//! failed precondition surfaces as `StoreError::Conflict` and the caller
//! retries the whole read-modify-write with jittered backoff. Handlers may
//! run on arbitrary concurrent instances, so nothing correctness-bearing
//! lives in process memory.
//!
//! Two implementations: `MemoryStore` for tests and `SqliteStore` for a
//! durable single-node deployment.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

/// Bounded optimistic-retry attempts before giving up on a contended commit.
pub const MAX_TXN_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("write conflict on {0}")]
    Conflict(String),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("backend: {0}")]
    Backend(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Unconditional upsert.
    None,
    /// The document must not exist yet.
    NotExists,
    /// The document must still be at this revision.
    Revision(u64),
}

#[derive(Debug, Clone)]
pub enum WriteOp {
    Put(Value),
    Delete,
}

#[derive(Debug, Clone)]
pub struct Write {
    pub path: String,
    pub precondition: Precondition,
    pub op: WriteOp,
}

impl Write {
    pub fn put<T: Serialize>(
        path: impl Into<String>,
        precondition: Precondition,
        doc: &T,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            path: path.into(),
            precondition,
            op: WriteOp::Put(serde_json::to_value(doc)?),
        })
    }

    pub fn delete(path: impl Into<String>, precondition: Precondition) -> Self {
        Self {
            path: path.into(),
            precondition,
            op: WriteOp::Delete,
        }
    }
}

/// A document read together with the revision it was read at.
#[derive(Debug, Clone)]
pub struct Snapshot<T> {
    pub doc: T,
    pub revision: u64,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_raw(&self, path: &str) -> Result<Option<(Value, u64)>, StoreError>;

    /// Atomically apply all writes; if any precondition fails nothing is
    /// applied and the first failing path is reported.
    async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError>;

    async fn list_raw(&self, prefix: &str) -> Result<Vec<(String, Value, u64)>, StoreError>;
}

/// Typed read helper.
pub async fn get_doc<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    path: &str,
) -> Result<Option<Snapshot<T>>, StoreError> {
    match store.get_raw(path).await? {
        Some((value, revision)) => Ok(Some(Snapshot {
            doc: serde_json::from_value(value)?,
            revision,
        })),
        None => Ok(None),
    }
}

/// Typed prefix listing.
pub async fn list_docs<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    prefix: &str,
) -> Result<Vec<(String, Snapshot<T>)>, StoreError> {
    let mut out = Vec::new();
    for (path, value, revision) in store.list_raw(prefix).await? {
        out.push((
            path,
            Snapshot {
                doc: serde_json::from_value(value)?,
                revision,
            },
        ));
    }
    Ok(out)
}

/// Sleep before the next optimistic-retry attempt.
pub async fn backoff(attempt: u32) {
    let jitter = rand::thread_rng().gen_range(0..25u64);
    tokio::time::sleep(Duration::from_millis(10 * attempt as u64 + jitter)).await;
}

// ============================================================================
// MEMORY STORE
// ============================================================================

/// In-memory implementation for tests and local development.
#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<String, (Value, u64)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_raw(&self, path: &str) -> Result<Option<(Value, u64)>, StoreError> {
        Ok(self.docs.lock().get(path).cloned())
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError> {
        let mut docs = self.docs.lock();

        for write in &writes {
            let current = docs.get(&write.path);
            match (&write.precondition, current) {
                (Precondition::None, _) => {}
                (Precondition::NotExists, None) => {}
                (Precondition::NotExists, Some(_)) => {
                    return Err(StoreError::Conflict(write.path.clone()));
                }
                (Precondition::Revision(rev), Some((_, current_rev))) if rev == current_rev => {}
                (Precondition::Revision(_), _) => {
                    return Err(StoreError::Conflict(write.path.clone()));
                }
            }
        }

        for write in writes {
            match write.op {
                WriteOp::Put(value) => {
                    let next_rev = docs.get(&write.path).map(|(_, r)| r + 1).unwrap_or(1);
                    docs.insert(write.path, (value, next_rev));
                }
                WriteOp::Delete => {
                    docs.remove(&write.path);
                }
            }
        }

        Ok(())
    }

    async fn list_raw(&self, prefix: &str) -> Result<Vec<(String, Value, u64)>, StoreError> {
        let docs = self.docs.lock();
        let mut out: Vec<_> = docs
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(path, (value, rev))| (path.clone(), value.clone(), *rev))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

// ============================================================================
// SQLITE STORE
// ============================================================================

/// Durable single-node implementation. One table of (path, doc, revision);
/// batch commits run inside a sqlite transaction so precondition checks and
/// writes are atomic.
pub struct SqliteStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        info!("sqlite document store ready");
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                path TEXT PRIMARY KEY,
                doc TEXT NOT NULL,
                revision INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get_raw(&self, path: &str) -> Result<Option<(Value, u64)>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT doc, revision FROM documents WHERE path = ?1",
                rusqlite::params![path],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)? as u64,
                    ))
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        match row {
            Some((doc, revision)) => Ok(Some((serde_json::from_str(&doc)?, revision))),
            None => Ok(None),
        }
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        for write in &writes {
            let current: Option<u64> = tx
                .query_row(
                    "SELECT revision FROM documents WHERE path = ?1",
                    rusqlite::params![write.path],
                    |row| row.get::<_, i64>(0).map(|r| r as u64),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;

            let ok = match (&write.precondition, current) {
                (Precondition::None, _) => true,
                (Precondition::NotExists, None) => true,
                (Precondition::Revision(rev), Some(current_rev)) => *rev == current_rev,
                _ => false,
            };
            if !ok {
                return Err(StoreError::Conflict(write.path.clone()));
            }
        }

        for write in &writes {
            match &write.op {
                WriteOp::Put(value) => {
                    tx.execute(
                        "INSERT INTO documents (path, doc, revision) VALUES (?1, ?2, 1)
                         ON CONFLICT(path) DO UPDATE SET doc = ?2, revision = revision + 1",
                        rusqlite::params![write.path, serde_json::to_string(value)?],
                    )?;
                }
                WriteOp::Delete => {
                    tx.execute(
                        "DELETE FROM documents WHERE path = ?1",
                        rusqlite::params![write.path],
                    )?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    async fn list_raw(&self, prefix: &str) -> Result<Vec<(String, Value, u64)>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT path, doc, revision FROM documents
             WHERE substr(path, 1, ?2) = ?1 ORDER BY path",
        )?;

        let rows = stmt
            .query_map(
                rusqlite::params![prefix, prefix.len() as i64],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)? as u64,
                    ))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(rows.len());
        for (path, doc, revision) in rows {
            out.push((path, serde_json::from_str(&doc)?, revision));
        }
        Ok(out)
    }
}
