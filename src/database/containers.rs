//! Container registry persistence

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;

use super::{DatabaseError, DatabaseResult};

/// Lifecycle status of a registered container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Stopped,
    Removed,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Running => "running",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Removed => "removed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(ContainerStatus::Running),
            "stopped" => Some(ContainerStatus::Stopped),
            "removed" => Some(ContainerStatus::Removed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted container record
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub user_id: String,
    pub container_id: String,
    pub container_name: String,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl ContainerRecord {
    /// Create a fresh running record
    pub fn new(
        user_id: impl Into<String>,
        container_id: impl Into<String>,
        container_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            container_id: container_id.into(),
            container_name: container_name.into(),
            status: ContainerStatus::Running,
            created_at: now,
            last_active: now,
        }
    }
}

/// Store for container records, indexed by container id with a secondary
/// index on user id. Last-writer-wins; no multi-record transactions.
pub struct ContainerStore;

impl ContainerStore {
    pub fn new() -> Self {
        Self
    }

    /// Insert or replace a record
    pub fn upsert(&self, conn: &Connection, record: &ContainerRecord) -> DatabaseResult<()> {
        conn.execute(
            r#"
            INSERT OR REPLACE INTO containers
                (container_id, user_id, container_name, status, created_at, last_active)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            rusqlite::params![
                record.container_id,
                record.user_id,
                record.container_name,
                record.status.as_str(),
                record.created_at.timestamp(),
                record.last_active.timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Update only the status field
    pub fn mark_status(
        &self,
        conn: &Connection,
        container_id: &str,
        status: ContainerStatus,
    ) -> DatabaseResult<()> {
        conn.execute(
            "UPDATE containers SET status = ?2 WHERE container_id = ?1",
            rusqlite::params![container_id, status.as_str()],
        )?;
        Ok(())
    }

    /// Refresh the last-active timestamp to now
    pub fn touch_last_active(&self, conn: &Connection, container_id: &str) -> DatabaseResult<()> {
        conn.execute(
            "UPDATE containers SET last_active = ?2 WHERE container_id = ?1",
            rusqlite::params![container_id, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    /// Delete a record
    pub fn delete(&self, conn: &Connection, container_id: &str) -> DatabaseResult<()> {
        conn.execute(
            "DELETE FROM containers WHERE container_id = ?1",
            [container_id],
        )?;
        Ok(())
    }

    /// All records whose status is not `removed`
    pub fn list_active(&self, conn: &Connection) -> DatabaseResult<Vec<ContainerRecord>> {
        let mut stmt = conn.prepare(
            r#"
            SELECT container_id, user_id, container_name, status, created_at, last_active
            FROM containers
            WHERE status != 'removed'
            "#,
        )?;

        let records = stmt
            .query_map([], Self::map_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// The non-removed record for a user, if any
    pub fn get_by_user(
        &self,
        conn: &Connection,
        user_id: &str,
    ) -> DatabaseResult<Option<ContainerRecord>> {
        let mut stmt = conn.prepare(
            r#"
            SELECT container_id, user_id, container_name, status, created_at, last_active
            FROM containers
            WHERE user_id = ?1 AND status != 'removed'
            "#,
        )?;

        let result = stmt.query_row([user_id], Self::map_row);

        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DatabaseError::from(e)),
        }
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContainerRecord> {
        let status: String = row.get(3)?;
        Ok(ContainerRecord {
            container_id: row.get(0)?,
            user_id: row.get(1)?,
            container_name: row.get(2)?,
            status: ContainerStatus::parse(&status).unwrap_or(ContainerStatus::Stopped),
            created_at: epoch_to_datetime(row.get(4)?),
            last_active: epoch_to_datetime(row.get(5)?),
        })
    }
}

impl Default for ContainerStore {
    fn default() -> Self {
        Self::new()
    }
}

fn epoch_to_datetime(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE containers (
                container_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                container_name TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_active INTEGER NOT NULL
            );
            "#,
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_upsert_and_get_by_user() {
        let conn = setup_db();
        let store = ContainerStore::new();

        let record = ContainerRecord::new("7", "abc123", "agent-user-7");
        store.upsert(&conn, &record).unwrap();

        let loaded = store.get_by_user(&conn, "7").unwrap().unwrap();
        assert_eq!(loaded.container_id, "abc123");
        assert_eq!(loaded.container_name, "agent-user-7");
        assert_eq!(loaded.status, ContainerStatus::Running);
    }

    #[test]
    fn test_mark_status_and_list_active() {
        let conn = setup_db();
        let store = ContainerStore::new();

        store
            .upsert(&conn, &ContainerRecord::new("1", "c1", "agent-user-1"))
            .unwrap();
        store
            .upsert(&conn, &ContainerRecord::new("2", "c2", "agent-user-2"))
            .unwrap();

        store
            .mark_status(&conn, "c1", ContainerStatus::Stopped)
            .unwrap();
        store
            .mark_status(&conn, "c2", ContainerStatus::Removed)
            .unwrap();

        let active = store.list_active(&conn).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].container_id, "c1");
        assert_eq!(active[0].status, ContainerStatus::Stopped);
    }

    #[test]
    fn test_removed_record_invisible_by_user() {
        let conn = setup_db();
        let store = ContainerStore::new();

        store
            .upsert(&conn, &ContainerRecord::new("7", "c7", "agent-user-7"))
            .unwrap();
        store
            .mark_status(&conn, "c7", ContainerStatus::Removed)
            .unwrap();

        assert!(store.get_by_user(&conn, "7").unwrap().is_none());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let conn = setup_db();
        let store = ContainerStore::new();

        store
            .upsert(&conn, &ContainerRecord::new("7", "c7", "agent-user-7"))
            .unwrap();
        store.delete(&conn, "c7").unwrap();
        store.delete(&conn, "c7").unwrap();

        assert!(store.list_active(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_touch_last_active() {
        let conn = setup_db();
        let store = ContainerStore::new();

        let mut record = ContainerRecord::new("7", "c7", "agent-user-7");
        record.last_active = Utc.timestamp_opt(1_000, 0).single().unwrap();
        store.upsert(&conn, &record).unwrap();

        store.touch_last_active(&conn, "c7").unwrap();

        let loaded = store.get_by_user(&conn, "7").unwrap().unwrap();
        assert!(loaded.last_active.timestamp() > 1_000);
    }
}
