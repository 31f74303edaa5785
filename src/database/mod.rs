//! Registry persistence module
//!
//! Provides SQLite-based storage for the container registry. The registry is
//! authoritative only across process restarts; while a process runs, the
//! in-memory container cache is authoritative and writes here are
//! best-effort.

mod containers;

pub use containers::{ContainerRecord, ContainerStatus, ContainerStore};

use std::path::Path;

use rusqlite::{Connection, Result as SqliteResult};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

/// Database errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Main database wrapper
pub struct Database {
    conn: Mutex<Connection>,
    store: ContainerStore,
}

impl Database {
    /// Open or create the database
    pub fn open(path: impl AsRef<Path>) -> DatabaseResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        Self::init_tables(&conn)?;

        info!("Registry database opened at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
            store: ContainerStore::new(),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_tables(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            store: ContainerStore::new(),
        })
    }

    /// Initialize database tables
    fn init_tables(conn: &Connection) -> SqliteResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS containers (
                container_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                container_name TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_active INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_containers_user
                ON containers(user_id);
            "#,
        )?;

        Ok(())
    }

    /// Insert or replace a container record
    pub async fn upsert(&self, record: &ContainerRecord) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        self.store.upsert(&conn, record)
    }

    /// Update the status of a container record
    pub async fn mark_status(
        &self,
        container_id: &str,
        status: ContainerStatus,
    ) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        self.store.mark_status(&conn, container_id, status)
    }

    /// Refresh the last-active timestamp
    pub async fn touch_last_active(&self, container_id: &str) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        self.store.touch_last_active(&conn, container_id)
    }

    /// Delete a container record
    pub async fn delete(&self, container_id: &str) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        self.store.delete(&conn, container_id)
    }

    /// List all records that are not removed
    pub async fn list_active(&self) -> DatabaseResult<Vec<ContainerRecord>> {
        let conn = self.conn.lock().await;
        self.store.list_active(&conn)
    }

    /// Find the non-removed record for a user, if any
    pub async fn get_by_user(&self, user_id: &str) -> DatabaseResult<Option<ContainerRecord>> {
        let conn = self.conn.lock().await;
        self.store.get_by_user(&conn, user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("registry.db");

        {
            let db = Database::open(&path).unwrap();
            db.upsert(&ContainerRecord::new("7", "c7", "agent-user-7"))
                .await
                .unwrap();
        }

        let db = Database::open(&path).unwrap();
        let record = db.get_by_user("7").await.unwrap().unwrap();
        assert_eq!(record.container_id, "c7");
        assert_eq!(record.status, ContainerStatus::Running);
    }

    #[tokio::test]
    async fn test_upsert_is_last_writer_wins() {
        let db = Database::open_in_memory().unwrap();

        db.upsert(&ContainerRecord::new("7", "c7", "agent-user-7"))
            .await
            .unwrap();

        let mut replacement = ContainerRecord::new("7", "c7", "agent-user-7");
        replacement.status = ContainerStatus::Stopped;
        db.upsert(&replacement).await.unwrap();

        let active = db.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].status, ContainerStatus::Stopped);
    }
}
