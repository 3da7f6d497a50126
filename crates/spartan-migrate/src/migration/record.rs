//! Applied-migration ledger.

use super::definition::MigrationDefinition;
use super::error::MigrationError;
use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;

/// Default name of the ledger table.
pub const DEFAULT_LEDGER_TABLE: &str = "spartan_migrations";

/// Proof that a migration unit was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    /// Identifier of the applied unit.
    pub identifier: String,
    /// When the unit was applied.
    pub applied_at: DateTime<Utc>,
    /// Checksum of the unit at apply time.
    pub checksum: String,
}

impl MigrationRecord {
    /// Create a record.
    pub fn new(
        identifier: impl Into<String>,
        applied_at: DateTime<Utc>,
        checksum: impl Into<String>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            applied_at,
            checksum: checksum.into(),
        }
    }

    /// Record a definition as applied now.
    ///
    /// Timestamps are truncated to microseconds so they survive a round
    /// trip through the ledger unchanged.
    pub fn applied_now(definition: &MigrationDefinition) -> Self {
        Self::new(
            definition.identifier.clone(),
            Utc::now().trunc_subsecs(6),
            definition.checksum.clone(),
        )
    }
}

/// Persistent ledger of applied migrations.
///
/// Implementations that also implement
/// [`SchemaStore`](crate::schema::SchemaStore) must make `insert` and
/// `remove` join the store's open transaction, so a record commits or rolls
/// back together with the schema change it describes.
pub trait RecordStore {
    /// Create the ledger if it does not exist. Returns true if it was created.
    fn initialize(&self) -> Result<bool, MigrationError>;

    /// Whether the ledger exists.
    fn is_initialized(&self) -> Result<bool, MigrationError>;

    /// All records, ascending by identifier (numeric version, then name).
    fn list(&self) -> Result<Vec<MigrationRecord>, MigrationError>;

    /// Persist a new record. Fails with `DuplicateRecord` if it exists.
    fn insert(&self, record: &MigrationRecord) -> Result<(), MigrationError>;

    /// Delete a record. Fails with `RecordNotFound` if absent.
    fn remove(&self, identifier: &str) -> Result<(), MigrationError>;
}

/// Check that a ledger table name is a plain SQL identifier.
pub fn validate_table_name(name: &str) -> Result<(), MigrationError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(MigrationError::InvalidConfig {
            message: format!("ledger table name {name:?} is not a plain identifier"),
        })
    }
}
