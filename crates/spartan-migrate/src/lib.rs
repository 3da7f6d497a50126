//! Spartan Migrate - versioned schema migrations.
//!
//! This crate tracks which migration units have been applied to a target
//! database, plans the pending ones, and applies or reverts each unit inside
//! its own transaction.

pub mod backend;
pub mod config;
pub mod error;
pub mod migration;
pub mod schema;

pub use backend::{MemoryBackend, SqliteBackend};
pub use config::MigrateConfig;
pub use error::Error;
pub use migration::{
    load, DirectorySource, Direction, FailedStep, MigrationDefinition, MigrationError,
    MigrationExecutor, MigrationPlan, MigrationRecord, MigrationSource, MigrationState,
    MigrationStatus, Migrator, Operation, PlanWarning, RecordStore, RollbackReport,
    RollbackTarget, RunReport, SourceEntry, StatusEntry, StatusReport, StepOutcome,
    UpgradeReport,
};
pub use schema::SchemaStore;
