//! Migration configuration.

use crate::migration::record::{validate_table_name, DEFAULT_LEDGER_TABLE};
use crate::migration::MigrationError;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default database name when `DB_NAME` is unset.
pub const DEFAULT_DB_NAME: &str = "spartan";

/// Directory holding SQLite database files.
pub const DEFAULT_DATABASE_DIR: &str = "./database";

/// Default directory of migration units.
pub const DEFAULT_MIGRATIONS_DIR: &str = "./database/migrations";

/// Default time to wait on a locked database, in milliseconds.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseKind {
    /// SQLite via rusqlite.
    Sqlite,
}

impl FromStr for DatabaseKind {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(DatabaseKind::Sqlite),
            other => Err(MigrationError::UnsupportedDatabase {
                kind: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseKind::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// Migration engine configuration.
#[derive(Debug, Clone)]
pub struct MigrateConfig {
    /// Database engine.
    pub database_kind: DatabaseKind,

    /// Path to the database file.
    pub database_path: PathBuf,

    /// Directory of migration units.
    pub migrations_dir: PathBuf,

    /// Name of the ledger table.
    pub table_name: String,

    /// How long to wait on a locked database.
    pub busy_timeout: Duration,
}

impl MigrateConfig {
    /// Create a configuration for the given database file.
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_kind: DatabaseKind::Sqlite,
            database_path: database_path.into(),
            migrations_dir: PathBuf::from(DEFAULT_MIGRATIONS_DIR),
            table_name: DEFAULT_LEDGER_TABLE.to_string(),
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        }
    }

    /// Database file path for a database name: `./database/{name}.db`.
    pub fn database_path_for(name: &str) -> PathBuf {
        PathBuf::from(DEFAULT_DATABASE_DIR).join(format!("{name}.db"))
    }

    /// Build a configuration from the process environment.
    ///
    /// Reads `DB_TYPE`, `DB_NAME`, `SPARTAN_MIGRATIONS_DIR` and
    /// `SPARTAN_MIGRATIONS_TABLE`.
    pub fn from_env() -> Result<Self, MigrationError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, MigrationError> {
        let database_kind = match lookup("DB_TYPE") {
            Some(kind) if !kind.trim().is_empty() => kind.parse()?,
            _ => DatabaseKind::Sqlite,
        };
        let name = lookup("DB_NAME")
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DB_NAME.to_string());

        let mut config = Self::new(Self::database_path_for(&name));
        config.database_kind = database_kind;
        if let Some(dir) = lookup("SPARTAN_MIGRATIONS_DIR") {
            config.migrations_dir = PathBuf::from(dir);
        }
        if let Some(table) = lookup("SPARTAN_MIGRATIONS_TABLE") {
            config.table_name = table;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the database file path.
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    /// Set the migrations directory.
    pub fn with_migrations_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.migrations_dir = dir.into();
        self
    }

    /// Set the ledger table name.
    pub fn with_table_name(mut self, name: impl Into<String>) -> Self {
        self.table_name = name.into();
        self
    }

    /// Set the busy timeout.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Check the configuration for values the engine cannot use.
    pub fn validate(&self) -> Result<(), MigrationError> {
        validate_table_name(&self.table_name)?;
        if self.database_path.as_os_str().is_empty() {
            return Err(MigrationError::InvalidConfig {
                message: "database path is empty".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self::new(Self::database_path_for(DEFAULT_DB_NAME))
    }
}
