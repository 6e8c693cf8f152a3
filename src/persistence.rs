//! # Bridge Store
//!
//! SQLite-backed key/value store that bridges street network ids to routing
//! engine ids for one graph identity.
//!
//! ## Keys
//!
//! - `intersection:<id>` → routing node id
//! - `node:<id>` → [`NodeRecord`]
//! - `pair:<a>-<b>` → reference ids traversing node `a` to node `b`
//!
//! Values are MessagePack. The store is written only while a graph builds and
//! read afterwards. A value that cannot be read or parsed is logged and
//! treated as absent, so a damaged entry behaves like a missing one.

use std::path::Path;
use std::sync::Mutex;

use log::warn;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::engine::NodeRecord;
use crate::error::{LockResultExt, MatchError, Result};

/// Key marking a fully written store.
const COMPLETE_KEY: &str = "meta:complete";

pub fn intersection_key(intersection_id: &str) -> String {
    format!("intersection:{}", intersection_id)
}

pub fn node_key(node_id: u64) -> String {
    format!("node:{}", node_id)
}

pub fn pair_key(from: u64, to: u64) -> String {
    format!("pair:{}-{}", from, to)
}

/// Persistent node/edge bridge for one graph identity.
pub struct BridgeStore {
    conn: Mutex<Connection>,
}

impl BridgeStore {
    // ========================================================================
    // Initialization
    // ========================================================================

    /// Open (or create) a store at the given database path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS bridge (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().or_poisoned("bridge store")
    }

    // ========================================================================
    // Raw Access
    // ========================================================================

    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM bridge WHERE key = ?",
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Read and decode a value, reporting corrupt entries as errors.
    pub fn try_get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(bytes) = self.get_raw(key).map_err(|e| MatchError::CacheCorruption {
            key: key.to_string(),
            message: e.to_string(),
        })?
        else {
            return Ok(None);
        };
        rmp_serde::from_slice(&bytes)
            .map(Some)
            .map_err(|e| MatchError::CacheCorruption {
                key: key.to_string(),
                message: e.to_string(),
            })
    }

    /// Read a value; unreadable entries are logged and read as absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.try_get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!("[BridgeStore] {}", e);
                None
            }
        }
    }

    pub fn has(&self, key: &str) -> bool {
        matches!(self.get_raw(key), Ok(Some(_)))
    }

    pub fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = encode(value)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO bridge (key, value) VALUES (?, ?)",
            params![key, bytes],
        )?;
        Ok(())
    }

    /// Write many entries in one transaction.
    pub fn put_many<T: Serialize>(&self, entries: &[(String, T)]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("INSERT OR REPLACE INTO bridge (key, value) VALUES (?, ?)")?;
            for (key, value) in entries {
                stmt.execute(params![key, encode(value)?])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Store a raw value without encoding. Exists so tests can plant bad data.
    #[doc(hidden)]
    pub fn put_raw(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO bridge (key, value) VALUES (?, ?)",
            params![key, bytes],
        )?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock()
            .ok()
            .and_then(|conn| {
                conn.query_row("SELECT COUNT(*) FROM bridge", [], |row| row.get::<_, i64>(0))
                    .ok()
            })
            .unwrap_or(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    // Bridge Records
    // ========================================================================

    pub fn intersection_node(&self, intersection_id: &str) -> Option<u64> {
        self.get(&intersection_key(intersection_id))
    }

    pub fn node(&self, node_id: u64) -> Option<NodeRecord> {
        self.get(&node_key(node_id))
    }

    /// Reference ids recorded for travel from node `from` to node `to`.
    pub fn pair_references(&self, from: u64, to: u64) -> Vec<String> {
        self.get(&pair_key(from, to)).unwrap_or_default()
    }

    pub fn mark_complete(&self) -> Result<()> {
        self.put(COMPLETE_KEY, &true)
    }

    /// Whether a build finished writing this store.
    pub fn is_complete(&self) -> bool {
        self.get::<bool>(COMPLETE_KEY).unwrap_or(false)
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec(value).map_err(|e| MatchError::Persistence {
        message: format!("failed to encode bridge value: {}", e),
    })
}

#[cfg(all(test, feature = "persistence"))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_typed_round_trip() {
        let store = BridgeStore::in_memory().unwrap();
        store.put(&intersection_key("int-a"), &42u64).unwrap();
        store
            .put(
                &node_key(42),
                &NodeRecord {
                    id: 42,
                    lon: 0.01,
                    lat: 0.02,
                },
            )
            .unwrap();
        store
            .put(&pair_key(42, 43), &vec!["ref-1".to_string()])
            .unwrap();

        assert_eq!(store.intersection_node("int-a"), Some(42));
        assert_eq!(store.node(42).unwrap().lat, 0.02);
        assert_eq!(store.pair_references(42, 43), vec!["ref-1"]);
        assert!(store.pair_references(43, 42).is_empty());
        assert!(store.has("pair:42-43"));
        assert!(!store.has("pair:43-42"));
    }

    #[test]
    fn test_corrupt_value_reads_as_missing() {
        let store = BridgeStore::in_memory().unwrap();
        store.put_raw(&intersection_key("int-a"), &[0xc1]).unwrap();

        assert_eq!(store.intersection_node("int-a"), None);
        assert!(matches!(
            store.try_get::<u64>(&intersection_key("int-a")),
            Err(MatchError::CacheCorruption { .. })
        ));
    }

    #[test]
    fn test_reopen_persists_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bridge.db");
        {
            let store = BridgeStore::open(&path).unwrap();
            store
                .put_many(&[
                    (intersection_key("int-a"), 1u64),
                    (intersection_key("int-b"), 2u64),
                ])
                .unwrap();
            store.mark_complete().unwrap();
        }

        let store = BridgeStore::open(&path).unwrap();
        assert!(store.is_complete());
        assert_eq!(store.intersection_node("int-b"), Some(2));
        assert_eq!(store.len(), 3);
    }
}
