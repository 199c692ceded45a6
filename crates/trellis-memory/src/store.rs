use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::MemoryStore;
use trellis_core::types::{MemoryEntry, SearchResult, ThreadId, TAG_LONG_TERM};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS memories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        agent_id TEXT NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        tags TEXT NOT NULL,
        thread_scope TEXT,
        timestamp TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_memories_agent
        ON memories(agent_id, id);

    CREATE TABLE IF NOT EXISTS memory_tags (
        memory_id INTEGER NOT NULL REFERENCES memories(id),
        tag TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_memory_tags_tag
        ON memory_tags(tag, memory_id);

    CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
        content,
        agent_id UNINDEXED,
        tokenize='porter unicode61'
    );

    CREATE TRIGGER IF NOT EXISTS memories_ai AFTER INSERT ON memories BEGIN
        INSERT INTO memories_fts(rowid, content, agent_id)
        VALUES (new.id, new.content, new.agent_id);
    END;";

/// SQLite-backed memory store with tag lookup and FTS5 full-text search.
pub struct SqliteMemory {
    conn: Mutex<Connection>,
}

impl SqliteMemory {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TrellisError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| TrellisError::Database(e.to_string()))?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        debug!(path = %path.display(), "SQLite memory opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| TrellisError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Full-text search across every agent's memories.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT m.agent_id, m.role, m.content, m.tags, m.timestamp, f.rank
                 FROM memories_fts f
                 JOIN memories m ON m.id = f.rowid
                 WHERE memories_fts MATCH ?1
                 ORDER BY f.rank
                 LIMIT ?2",
            )
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(params![query, limit as i64], |row| {
                let tags: String = row.get(3)?;
                let ts_str: String = row.get(4)?;
                Ok(SearchResult {
                    agent_id: row.get(0)?,
                    role: row.get(1)?,
                    content: row.get(2)?,
                    tags: serde_json::from_str(&tags).unwrap_or_default(),
                    timestamp: parse_timestamp(&ts_str),
                    rank: row.get(5)?,
                })
            })
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row.map_err(|e| TrellisError::Database(e.to_string()))?);
        }
        Ok(results)
    }

    /// Every entry written while the given thread was active, oldest first.
    pub fn thread_entries(&self, thread: &ThreadId) -> Result<Vec<MemoryEntry>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT agent_id, role, content, tags, thread_scope, timestamp
                 FROM memories
                 WHERE thread_scope = ?1
                 ORDER BY id ASC",
            )
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(params![thread.0], row_to_entry)
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.map_err(|e| TrellisError::Database(e.to_string()))?);
        }
        Ok(entries)
    }
}

fn parse_timestamp(ts: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryEntry> {
    let tags: String = row.get(3)?;
    let thread_scope: Option<String> = row.get(4)?;
    let ts_str: String = row.get(5)?;
    Ok(MemoryEntry {
        agent_id: row.get(0)?,
        role: row.get(1)?,
        content: row.get(2)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        thread_scope: thread_scope.map(ThreadId),
        timestamp: parse_timestamp(&ts_str),
    })
}

impl MemoryStore for SqliteMemory {
    fn append(&self, entry: MemoryEntry) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let tags = serde_json::to_string(&entry.tags)?;
            let mut conn = self
                .conn
                .lock()
                .map_err(|e| TrellisError::Database(e.to_string()))?;

            let tx = conn
                .transaction()
                .map_err(|e| TrellisError::Database(e.to_string()))?;
            tx.execute(
                "INSERT INTO memories (agent_id, role, content, tags, thread_scope, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.agent_id,
                    entry.role,
                    entry.content,
                    tags,
                    entry.thread_scope.as_ref().map(|t| t.0.as_str()),
                    entry.timestamp.to_rfc3339(),
                ],
            )
            .map_err(|e| TrellisError::Database(e.to_string()))?;

            let memory_id = tx.last_insert_rowid();
            for tag in &entry.tags {
                tx.execute(
                    "INSERT INTO memory_tags (memory_id, tag) VALUES (?1, ?2)",
                    params![memory_id, tag],
                )
                .map_err(|e| TrellisError::Database(e.to_string()))?;
            }
            tx.commit().map_err(|e| TrellisError::Database(e.to_string()))?;

            debug!(agent_id = %entry.agent_id, memory_id, "Memory appended");
            Ok(())
        })
    }

    fn recall(&self, agent_id: &str, limit: usize) -> BoxFuture<'_, Result<Vec<MemoryEntry>>> {
        let agent_id = agent_id.to_string();

        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| TrellisError::Database(e.to_string()))?;

            let mut stmt = conn
                .prepare(
                    "SELECT m.agent_id, m.role, m.content, m.tags, m.thread_scope, m.timestamp
                     FROM memories m
                     JOIN memory_tags t ON t.memory_id = m.id
                     WHERE m.agent_id = ?1 AND t.tag = ?2
                     ORDER BY m.id DESC
                     LIMIT ?3",
                )
                .map_err(|e| TrellisError::Database(e.to_string()))?;

            let rows = stmt
                .query_map(params![agent_id, TAG_LONG_TERM, limit as i64], row_to_entry)
                .map_err(|e| TrellisError::Database(e.to_string()))?;

            let mut entries = Vec::new();
            for row in rows {
                entries.push(row.map_err(|e| TrellisError::Database(e.to_string()))?);
            }
            // Newest-first from the query; callers expect chronological order.
            entries.reverse();
            Ok(entries)
        })
    }
}
