//! Migration-specific error types.

use thiserror::Error;

/// Migration-specific errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Two units share an identifier or a version token.
    #[error("conflicting migration definitions: {first} and {second}")]
    DefinitionConflict {
        /// The unit that was seen first.
        first: String,
        /// The unit that collided with it.
        second: String,
    },

    /// A unit could not be parsed into forward/reverse operation lists.
    #[error("cannot parse migration {name}: {reason}")]
    DefinitionParseError {
        /// The source entry name.
        name: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A record with this identifier already exists.
    #[error("migration record already exists: {identifier}")]
    DuplicateRecord {
        /// The duplicated identifier.
        identifier: String,
    },

    /// No record exists for this identifier.
    #[error("migration record not found: {identifier}")]
    RecordNotFound {
        /// The missing identifier.
        identifier: String,
    },

    /// Forward operations of a unit failed; nothing was committed.
    #[error("failed to apply migration {identifier}: {cause}")]
    MigrationApplyFailed {
        /// The unit that failed.
        identifier: String,
        /// Raw cause reported by the schema store.
        cause: String,
    },

    /// Reverse operations of a unit failed; nothing was committed.
    #[error("failed to revert migration {identifier}: {cause}")]
    MigrationRevertFailed {
        /// The unit that failed.
        identifier: String,
        /// Raw cause reported by the schema store.
        cause: String,
    },

    /// A requested target identifier matches no loaded definition.
    #[error("unknown migration target: {identifier}")]
    UnknownTarget {
        /// The requested target.
        identifier: String,
    },

    /// The configured database type has no backend.
    #[error("unsupported database type: {kind}")]
    UnsupportedDatabase {
        /// The configured type.
        kind: String,
    },

    /// Configuration failed validation.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// The migration source could not be read.
    #[error("cannot read migration source {location}: {reason}")]
    Source {
        /// Where the source was read from.
        location: String,
        /// The underlying failure.
        reason: String,
    },

    /// Backend error.
    #[error("storage error: {0}")]
    Storage(#[from] crate::error::Error),
}

impl MigrationError {
    /// Identifier of the unit this error is scoped to, if any.
    pub fn identifier(&self) -> Option<&str> {
        match self {
            MigrationError::DuplicateRecord { identifier }
            | MigrationError::RecordNotFound { identifier }
            | MigrationError::MigrationApplyFailed { identifier, .. }
            | MigrationError::MigrationRevertFailed { identifier, .. }
            | MigrationError::UnknownTarget { identifier } => Some(identifier),
            _ => None,
        }
    }
}
