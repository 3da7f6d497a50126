//! SQLite schema and record store.

use crate::config::MigrateConfig;
use crate::error::Error;
use crate::migration::record::{validate_table_name, DEFAULT_LEDGER_TABLE};
use crate::migration::{
    compare_identifiers, MigrationError, MigrationRecord, Operation, RecordStore,
};
use crate::schema::SchemaStore;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::time::Duration;

/// SQLite backend.
///
/// One connection serves both schema operations and the ledger, so ledger
/// writes made while a transaction is open commit or roll back with it.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    table: String,
}

impl SqliteBackend {
    /// Open (or create) a database file using the configured ledger table
    /// and busy timeout.
    pub fn open(config: &MigrateConfig) -> Result<Self, MigrationError> {
        config.validate()?;
        if let Some(parent) = config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(Error::from)?;
            }
        }

        let conn = Connection::open(&config.database_path).map_err(Error::from)?;
        conn.busy_timeout(config.busy_timeout).map_err(Error::from)?;

        tracing::debug!(
            path = %config.database_path.display(),
            table = %config.table_name,
            "opened sqlite database"
        );
        Self::with_connection(conn, &config.table_name)
    }

    /// Open a database file with the default ledger table.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self, MigrationError> {
        Self::open(&MigrateConfig::new(path.as_ref()))
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, MigrationError> {
        let conn = Connection::open_in_memory().map_err(Error::from)?;
        Self::with_connection(conn, DEFAULT_LEDGER_TABLE)
    }

    /// Wrap an existing connection.
    pub fn with_connection(conn: Connection, table: &str) -> Result<Self, MigrationError> {
        validate_table_name(table)?;
        Ok(Self {
            conn: Mutex::new(conn),
            table: table.to_string(),
        })
    }

    /// Set how long to wait on a locked database.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<(), Error> {
        self.conn.lock().busy_timeout(timeout)?;
        Ok(())
    }

    /// Name of the ledger table.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Names of user tables, sorted. The ledger table is excluded.
    pub fn tables(&self) -> Result<Vec<String>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name != ?1 \
             ORDER BY name",
        )?;
        let names = stmt
            .query_map(params![self.table], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn table_exists(conn: &Connection, name: &str) -> Result<bool, Error> {
        let found = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::InvalidData(format!("bad applied_at {value:?}: {e}")))
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl SchemaStore for SqliteBackend {
    fn begin_transaction(&self) -> Result<(), Error> {
        let conn = self.conn.lock();
        if !conn.is_autocommit() {
            return Err(Error::Transaction("transaction already open".to_string()));
        }
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn execute(&self, operation: &Operation) -> Result<(), Error> {
        self.conn.lock().execute_batch(operation.as_str())?;
        Ok(())
    }

    fn commit(&self) -> Result<(), Error> {
        let conn = self.conn.lock();
        if conn.is_autocommit() {
            return Err(Error::Transaction("commit without an open transaction".to_string()));
        }
        conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&self) -> Result<(), Error> {
        let conn = self.conn.lock();
        // SQLite may already have rolled back on its own after some errors.
        if conn.is_autocommit() {
            return Ok(());
        }
        conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

impl RecordStore for SqliteBackend {
    fn initialize(&self) -> Result<bool, MigrationError> {
        let conn = self.conn.lock();
        if Self::table_exists(&conn, &self.table)? {
            return Ok(false);
        }

        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                identifier TEXT PRIMARY KEY NOT NULL,
                applied_at TEXT NOT NULL,
                checksum TEXT NOT NULL
            )",
            self.table
        ))
        .map_err(Error::from)?;

        tracing::info!(table = %self.table, "created migration ledger");
        Ok(true)
    }

    fn is_initialized(&self) -> Result<bool, MigrationError> {
        let conn = self.conn.lock();
        Ok(Self::table_exists(&conn, &self.table)?)
    }

    fn list(&self) -> Result<Vec<MigrationRecord>, MigrationError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT identifier, applied_at, checksum FROM {}",
                self.table
            ))
            .map_err(Error::from)?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(Error::from)?;

        let mut records = Vec::new();
        for row in rows {
            let (identifier, applied_at, checksum) = row.map_err(Error::from)?;
            records.push(MigrationRecord {
                identifier,
                applied_at: parse_timestamp(&applied_at)?,
                checksum,
            });
        }
        records.sort_by(|a, b| compare_identifiers(&a.identifier, &b.identifier));
        Ok(records)
    }

    fn insert(&self, record: &MigrationRecord) -> Result<(), MigrationError> {
        let conn = self.conn.lock();
        let result = conn.execute(
            &format!(
                "INSERT INTO {} (identifier, applied_at, checksum) VALUES (?1, ?2, ?3)",
                self.table
            ),
            params![
                record.identifier,
                format_timestamp(&record.applied_at),
                record.checksum
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(MigrationError::DuplicateRecord {
                    identifier: record.identifier.clone(),
                })
            }
            Err(err) => Err(Error::from(err).into()),
        }
    }

    fn remove(&self, identifier: &str) -> Result<(), MigrationError> {
        let conn = self.conn.lock();
        let removed = conn
            .execute(
                &format!("DELETE FROM {} WHERE identifier = ?1", self.table),
                params![identifier],
            )
            .map_err(Error::from)?;

        if removed == 0 {
            return Err(MigrationError::RecordNotFound {
                identifier: identifier.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(identifier: &str) -> MigrationRecord {
        MigrationRecord::new(
            identifier,
            DateTime::parse_from_rfc3339("2024-01-01T08:00:00.123456Z")
                .unwrap()
                .with_timezone(&Utc),
            "abc123",
        )
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        assert!(!backend.is_initialized().unwrap());
        assert!(backend.initialize().unwrap());
        assert!(!backend.initialize().unwrap());
        assert!(backend.is_initialized().unwrap());
    }

    #[test]
    fn test_record_round_trip() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.initialize().unwrap();

        backend.insert(&record("2024010200_create_nodes")).unwrap();
        backend.insert(&record("2024010100_create_farms")).unwrap();

        let records = backend.list().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], record("2024010100_create_farms"));
        assert_eq!(records[1].identifier, "2024010200_create_nodes");
    }

    #[test]
    fn test_list_orders_by_numeric_version() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.initialize().unwrap();
        backend.insert(&record("9_a")).unwrap();
        backend.insert(&record("10_b")).unwrap();
        backend.insert(&record("009_0")).unwrap();

        let ids: Vec<_> = backend.list().unwrap().into_iter().map(|r| r.identifier).collect();
        assert_eq!(ids, vec!["009_0", "9_a", "10_b"]);
    }

    #[test]
    fn test_duplicate_and_missing_records() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.initialize().unwrap();
        backend.insert(&record("1_users")).unwrap();

        assert!(matches!(
            backend.insert(&record("1_users")),
            Err(MigrationError::DuplicateRecord { identifier }) if identifier == "1_users"
        ));

        backend.remove("1_users").unwrap();
        assert!(matches!(
            backend.remove("1_users"),
            Err(MigrationError::RecordNotFound { .. })
        ));
    }

    #[test]
    fn test_record_writes_join_transaction() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.initialize().unwrap();

        backend.begin_transaction().unwrap();
        backend
            .execute(&Operation::new("CREATE TABLE farms (id INTEGER PRIMARY KEY)"))
            .unwrap();
        backend.insert(&record("1_farms")).unwrap();
        backend.rollback().unwrap();

        assert!(backend.list().unwrap().is_empty());
        assert!(backend.tables().unwrap().is_empty());
    }

    #[test]
    fn test_transaction_misuse() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        assert!(matches!(backend.commit(), Err(Error::Transaction(_))));

        backend.begin_transaction().unwrap();
        assert!(matches!(
            backend.begin_transaction(),
            Err(Error::Transaction(_))
        ));
        backend.commit().unwrap();
    }

    #[test]
    fn test_custom_table_and_tables_listing() {
        let dir = tempfile::tempdir().unwrap();
        let config = MigrateConfig::new(dir.path().join("nested").join("agnes.db"))
            .with_table_name("schema_versions");
        let backend = SqliteBackend::open(&config).unwrap();
        backend.initialize().unwrap();
        backend
            .execute(&Operation::new("CREATE TABLE users (id INTEGER PRIMARY KEY)"))
            .unwrap();

        assert_eq!(backend.table(), "schema_versions");
        assert_eq!(backend.tables().unwrap(), vec!["users"]);
        assert!(dir.path().join("nested").join("agnes.db").exists());
    }

    #[test]
    fn test_rejects_bad_table_name() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(matches!(
            SqliteBackend::with_connection(conn, "x; DROP TABLE users"),
            Err(MigrationError::InvalidConfig { .. })
        ));
    }
}
