//! # murmur-db
//!
//! Local persistence for a murmur peer.
//!
//! Everything a peer remembers is a string value under a string key: the
//! identity, the pinned contact map and, per room, the member set, the
//! pending-join set, the room key and its key id. [`KvStore`] abstracts over
//! where those values live:
//!
//! - [`sqlite::SqliteStore`] — the single SQLite database at
//!   `$MURMUR_DATA_DIR/murmur.db` (WAL mode, `PRAGMA user_version` migrations)
//! - [`memory::MemoryStore`] — an in-process map for tests and ephemeral peers
//!
//! Key names are built by [`keys`] so that rooms never share a namespace.

pub mod keys;
pub mod memory;
pub mod migrations;
pub mod queries;
pub mod schema;
pub mod sqlite;

use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Database error types.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("store lock poisoned")]
    LockPoisoned,

    /// A stored value exists but cannot be decoded.
    #[error("corrupt value under '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// A string key-value store.
///
/// Implementations must be safe to share between tasks. Individual calls are
/// atomic; read-modify-write sequences are serialized by the caller.
pub trait KvStore: Send + Sync {
    /// Read the value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete `key`. Deleting a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// Delete every key.
    fn clear(&self) -> Result<()>;

    /// List stored keys that start with `prefix`, in key order.
    fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// JSON helpers available on every [`KvStore`].
pub trait KvStoreExt: KvStore {
    /// Read and decode a JSON value. A value that fails to decode is
    /// reported as [`DbError::Corrupt`] rather than treated as absent.
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| DbError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Encode and store a JSON value.
    fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let raw =
            serde_json::to_string(value).map_err(|e| DbError::Serialization(e.to_string()))?;
        self.set(key, &raw)
    }
}

impl<S: KvStore + ?Sized> KvStoreExt for S {}

/// Open or create the murmur database at the given path.
///
/// Configures WAL mode and runs any pending migrations.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure(&conn)?;
    migrations::run(&conn)?;
    Ok(conn)
}

/// Open an in-memory database (for testing).
pub fn open_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    migrations::run(&conn)?;
    Ok(conn)
}

/// Configure SQLite pragmas.
fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(())
}
