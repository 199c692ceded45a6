use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use trellis_core::error::{Result, TrellisError};

use crate::thread::{ThreadHierarchy, ThreadLimits};

/// Persistent snapshots of each agent's thread hierarchy, backed by SQLite.
///
/// One row per agent; saving replaces the previous snapshot.
pub struct HierarchyStore {
    conn: Mutex<Connection>,
}

/// Listing entry for a stored hierarchy.
#[derive(Debug, Clone)]
pub struct StoredHierarchy {
    pub agent_id: String,
    pub threads: usize,
    pub updated_at: DateTime<Utc>,
}

fn db_err(e: rusqlite::Error) -> TrellisError {
    TrellisError::Database(e.to_string())
}

impl HierarchyStore {
    /// Open or create the snapshot database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS hierarchies (
                 agent_id TEXT PRIMARY KEY,
                 snapshot TEXT NOT NULL,
                 threads INTEGER NOT NULL,
                 updated_at TEXT NOT NULL
             );",
        )
        .map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn save(&self, hierarchy: &ThreadHierarchy) -> Result<()> {
        let snapshot = serde_json::to_string(hierarchy)?;
        let conn = self.conn.lock().map_err(|e| TrellisError::Database(e.to_string()))?;
        conn.execute(
            "INSERT INTO hierarchies (agent_id, snapshot, threads, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(agent_id) DO UPDATE SET
                 snapshot = excluded.snapshot,
                 threads = excluded.threads,
                 updated_at = excluded.updated_at",
            params![
                hierarchy.agent_id,
                snapshot,
                hierarchy.len() as i64,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Load an agent's hierarchy, applying the current limits.
    pub fn load(&self, agent_id: &str, limits: ThreadLimits) -> Result<Option<ThreadHierarchy>> {
        let conn = self.conn.lock().map_err(|e| TrellisError::Database(e.to_string()))?;
        let snapshot: Option<String> = conn
            .query_row(
                "SELECT snapshot FROM hierarchies WHERE agent_id = ?1",
                params![agent_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match snapshot {
            Some(json) => {
                let hierarchy: ThreadHierarchy = serde_json::from_str(&json)?;
                Ok(Some(hierarchy.with_limits(limits)))
            }
            None => Ok(None),
        }
    }

    pub fn delete(&self, agent_id: &str) -> Result<bool> {
        let conn = self.conn.lock().map_err(|e| TrellisError::Database(e.to_string()))?;
        let deleted = conn
            .execute("DELETE FROM hierarchies WHERE agent_id = ?1", params![agent_id])
            .map_err(db_err)?;
        Ok(deleted > 0)
    }

    /// Every stored agent, most recently updated first.
    pub fn list(&self) -> Result<Vec<StoredHierarchy>> {
        let conn = self.conn.lock().map_err(|e| TrellisError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare("SELECT agent_id, threads, updated_at FROM hierarchies ORDER BY updated_at DESC")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                let ts: String = row.get(2)?;
                Ok(StoredHierarchy {
                    agent_id: row.get(0)?,
                    threads: row.get::<_, i64>(1)? as usize,
                    updated_at: DateTime::parse_from_rfc3339(&ts)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })
            .map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadStatus;
    use trellis_core::types::Role;

    #[test]
    fn test_save_and_load() {
        let store = HierarchyStore::in_memory().unwrap();
        let mut h = ThreadHierarchy::new("ada", 10_000, ThreadLimits::default());
        let child = h.enter(Some(0.5), Some("plan".into())).unwrap();
        h.record(Role::Assistant, "drafting", vec![]).unwrap();
        store.save(&h).unwrap();

        let loaded = store.load("ada", ThreadLimits::default()).unwrap().unwrap();
        assert_eq!(loaded.active_id(), &child);
        assert_eq!(loaded.get(&child).unwrap().budget, 5_000);
        assert_eq!(loaded.get(&child).unwrap().status, ThreadStatus::Active);
        assert!(store.load("nobody", ThreadLimits::default()).unwrap().is_none());
    }

    #[test]
    fn test_save_replaces_snapshot() {
        let store = HierarchyStore::in_memory().unwrap();
        let mut h = ThreadHierarchy::new("ada", 10_000, ThreadLimits::default());
        store.save(&h).unwrap();
        h.enter(None, None).unwrap();
        store.save(&h).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].threads, 2);

        assert!(store.delete("ada").unwrap());
        assert!(!store.delete("ada").unwrap());
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("threads.db");
        {
            let store = HierarchyStore::open(&path).unwrap();
            store
                .save(&ThreadHierarchy::new("bo", 1_000, ThreadLimits::default()))
                .unwrap();
        }
        let store = HierarchyStore::open(&path).unwrap();
        assert!(store.load("bo", ThreadLimits::default()).unwrap().is_some());
    }
}
