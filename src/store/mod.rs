mod links;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::message::Endpoint;

/// One persisted directed edge
#[derive(Debug, Clone, PartialEq)]
pub struct LinkRecord {
    pub from: Endpoint,
    pub to: Endpoint,
    pub established_at: DateTime<Utc>,
    /// Free-form reason, e.g. who placed the call
    pub cause: Option<String>,
}

impl LinkRecord {
    pub fn new(from: Endpoint, to: Endpoint, cause: Option<String>) -> Self {
        Self {
            from,
            to,
            established_at: Utc::now(),
            cause,
        }
    }
}

/// Durable home of the link graph.
#[async_trait]
pub trait LinkStore: Send + Sync {
    /// Every persisted edge, for rebuilding the graph at startup
    async fn list_links(&self) -> Result<Vec<LinkRecord>>;

    /// Insert an edge. An identical existing edge is left alone and is not an error.
    async fn upsert_link(&self, record: &LinkRecord) -> Result<()>;

    /// Delete an edge. Deleting a missing edge is not an error.
    async fn delete_link(&self, from: &Endpoint, to: &Endpoint) -> Result<()>;
}

/// SQLite-backed link store
#[derive(Clone)]
pub struct SqliteLinkStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLinkStore {
    /// Open or create the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        // Migrate before wrapping in the async Mutex so no lock is needed here
        Self::run_migrations(&conn)?;

        info!("Link store initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        // Channel id columns are declared without a type so integers and
        // strings keep their storage class.
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS links (
                from_type TEXT NOT NULL,
                from_id NOT NULL,
                to_type TEXT NOT NULL,
                to_id NOT NULL,
                established_at TEXT NOT NULL,
                cause TEXT,
                PRIMARY KEY (from_type, from_id, to_type, to_id)
            );

            CREATE INDEX IF NOT EXISTS idx_links_to
                ON links(to_type, to_id);
            ",
        )
        .context("Failed to run link store migrations")?;
        Ok(())
    }
}
