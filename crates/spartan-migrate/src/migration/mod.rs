//! Versioned schema migrations.
//!
//! A migration unit is a `<version>_<name>.sql` file with a `-- migrate:up`
//! section and a `-- migrate:down` section. This module provides:
//! - Loading and ordering units from a source
//! - A ledger of applied units ([`RecordStore`])
//! - Planning upgrades, rollbacks and status from the ledger
//! - Executing each unit in its own transaction

pub mod definition;
pub mod error;
pub mod executor;
pub mod loader;
pub mod migrator;
pub mod planner;
pub mod record;

pub use definition::{
    checksum, compare_identifiers, split_statements, MigrationDefinition, Operation,
};
pub use error::MigrationError;
pub use executor::{MigrationExecutor, MigrationState, StepOutcome};
pub use loader::{load, load_from, DirectorySource, MigrationSource, SourceEntry};
pub use migrator::{FailedStep, Migrator, RollbackReport, RunReport, UpgradeReport};
pub use planner::{
    detect_drift, Direction, MigrationPlan, MigrationStatus, PlanStep, PlanWarning,
    RollbackTarget, StatusEntry, StatusReport,
};
pub use record::{MigrationRecord, RecordStore, DEFAULT_LEDGER_TABLE};
