//! `migrate` subcommand handlers.

use crate::formatter::Formatter;
use crate::MigrateCommand;
use spartan_migrate::{
    MigrationError, Migrator, RecordStore, RollbackTarget, RunReport, SchemaStore,
};

/// What a command prints.
#[derive(Debug)]
pub struct CommandOutput {
    /// Text for stdout.
    pub output: String,
    /// Failure description for stderr. Set when the command must exit non-zero.
    pub failure: Option<String>,
}

impl CommandOutput {
    fn ok(output: String) -> Self {
        Self {
            output,
            failure: None,
        }
    }

    fn from_run(report: &RunReport, formatter: &dyn Formatter) -> Self {
        Self {
            output: formatter.format_run(report),
            failure: report
                .failed
                .as_ref()
                .map(|failed| format!("{}: {}", failed.identifier, failed.error)),
        }
    }
}

/// Map `--steps` / `--to` onto a rollback target. Defaults to one step.
pub fn rollback_target(steps: Option<usize>, to: Option<&str>) -> RollbackTarget {
    match to {
        Some(identifier) => RollbackTarget::To(identifier.to_string()),
        None => RollbackTarget::Steps(steps.unwrap_or(1)),
    }
}

/// Execute a `migrate` subcommand.
///
/// Errors raised before any mutation (loader, ledger, planning) are returned
/// as `Err`; a unit that fails mid-run is reported in `CommandOutput::failure`.
pub fn execute<B>(
    migrator: &Migrator<'_, B>,
    command: &MigrateCommand,
    formatter: &dyn Formatter,
) -> Result<CommandOutput, MigrationError>
where
    B: SchemaStore + RecordStore,
{
    match command {
        MigrateCommand::Init => {
            let created = migrator.init()?;
            Ok(CommandOutput::ok(formatter.format_init(created)))
        }
        MigrateCommand::Upgrade { target } => {
            let report = migrator.upgrade(target.as_deref())?;
            Ok(CommandOutput::from_run(&report, formatter))
        }
        MigrateCommand::Rollback { steps, to } => {
            let report = migrator.rollback(&rollback_target(*steps, to.as_deref()))?;
            Ok(CommandOutput::from_run(&report, formatter))
        }
        MigrateCommand::Status => {
            let report = migrator.status()?;
            Ok(CommandOutput::ok(formatter.format_status(&report)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::TableFormatter;
    use spartan_migrate::{DirectorySource, SqliteBackend};
    use std::fs;
    use tempfile::TempDir;

    struct TestContext {
        _dir: TempDir,
        backend: SqliteBackend,
        source: DirectorySource,
    }

    impl TestContext {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let migrations = dir.path().join("migrations");
            fs::create_dir_all(&migrations).unwrap();
            fs::write(
                migrations.join("2024010100_create_farms.sql"),
                "-- migrate:up\nCREATE TABLE farms (id INTEGER PRIMARY KEY, name TEXT NOT NULL);\n\
                 -- migrate:down\nDROP TABLE farms;\n",
            )
            .unwrap();
            fs::write(
                migrations.join("2024010200_create_nodes.sql"),
                "-- migrate:up\nCREATE TABLE nodes (id INTEGER PRIMARY KEY, \
                 farm_id INTEGER NOT NULL REFERENCES farms(id));\n\
                 -- migrate:down\nDROP TABLE nodes;\n",
            )
            .unwrap();

            let backend = SqliteBackend::open_path(dir.path().join("agnes.db")).unwrap();
            Self {
                _dir: dir,
                backend,
                source: DirectorySource::new(migrations),
            }
        }

        fn run(&self, command: MigrateCommand) -> Result<CommandOutput, MigrationError> {
            let migrator = Migrator::new(&self.backend, &self.source);
            execute(&migrator, &command, &TableFormatter)
        }
    }

    #[test]
    fn test_rollback_target_defaults() {
        assert_eq!(rollback_target(None, None), RollbackTarget::Steps(1));
        assert_eq!(rollback_target(Some(3), None), RollbackTarget::Steps(3));
        assert_eq!(
            rollback_target(None, Some("2024010100_create_farms")),
            RollbackTarget::To("2024010100_create_farms".to_string())
        );
    }

    #[test]
    fn test_init_twice() {
        let ctx = TestContext::new();
        assert_eq!(ctx.run(MigrateCommand::Init).unwrap().output, "initialized");
        assert_eq!(
            ctx.run(MigrateCommand::Init).unwrap().output,
            "already initialized"
        );
    }

    #[test]
    fn test_upgrade_status_rollback() {
        let ctx = TestContext::new();

        let upgrade = ctx.run(MigrateCommand::Upgrade { target: None }).unwrap();
        assert!(upgrade.failure.is_none());
        assert!(upgrade.output.contains("applied 2024010100_create_farms"));
        assert!(upgrade.output.contains("applied 2024010200_create_nodes"));
        assert_eq!(ctx.backend.tables().unwrap(), vec!["farms", "nodes"]);

        let status = ctx.run(MigrateCommand::Status).unwrap();
        assert!(status.output.contains("2 migration(s), 0 pending, 0 drifted"));

        let rollback = ctx
            .run(MigrateCommand::Rollback {
                steps: None,
                to: None,
            })
            .unwrap();
        assert!(rollback.output.contains("reverted 2024010200_create_nodes"));
        assert_eq!(ctx.backend.tables().unwrap(), vec!["farms"]);
    }

    #[test]
    fn test_failed_unit_is_reported() {
        let ctx = TestContext::new();
        fs::write(
            ctx.source.dir().join("2024010300_broken.sql"),
            "-- migrate:up\nCREATE TABLE readings (id INTEGER PRIMARY KEY);\n\
             INSERT INTO missing_table VALUES (1);\n\
             -- migrate:down\nDROP TABLE readings;\n",
        )
        .unwrap();

        let output = ctx.run(MigrateCommand::Upgrade { target: None }).unwrap();
        let failure = output.failure.unwrap();
        assert!(failure.starts_with("2024010300_broken: "));
        assert!(failure.contains("missing_table"));
        assert_eq!(ctx.backend.tables().unwrap(), vec!["farms", "nodes"]);
    }

    #[test]
    fn test_unknown_target_is_an_error() {
        let ctx = TestContext::new();
        let result = ctx.run(MigrateCommand::Upgrade {
            target: Some("2030010100_nope".to_string()),
        });
        assert!(matches!(result, Err(MigrationError::UnknownTarget { .. })));
        assert!(!ctx.backend.is_initialized().unwrap());
    }
}
