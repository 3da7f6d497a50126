//! Command-level orchestration.
//!
//! Ties the loader, ledger, planner and executor together for the `init`,
//! `upgrade`, `rollback` and `status` commands.

use super::definition::MigrationDefinition;
use super::error::MigrationError;
use super::executor::{MigrationExecutor, StepOutcome};
use super::loader::{load_from, MigrationSource};
use super::planner::{Direction, MigrationPlan, PlanWarning, RollbackTarget, StatusReport};
use super::record::RecordStore;
use crate::schema::SchemaStore;

/// The step that stopped a run.
#[derive(Debug)]
pub struct FailedStep {
    /// Identifier of the failed unit.
    pub identifier: String,
    /// What went wrong.
    pub error: MigrationError,
}

/// Outcome of an `upgrade` or `rollback` run.
#[derive(Debug)]
pub struct RunReport {
    /// Direction of the run.
    pub direction: Direction,
    /// Steps that completed and committed, in order.
    pub completed: Vec<StepOutcome>,
    /// The step that failed, if any.
    pub failed: Option<FailedStep>,
    /// Planned steps that never ran because of the failure.
    pub not_run: Vec<String>,
    /// Drift found while planning.
    pub warnings: Vec<PlanWarning>,
}

/// Report of an `upgrade` run.
pub type UpgradeReport = RunReport;

/// Report of a `rollback` run.
pub type RollbackReport = RunReport;

impl RunReport {
    /// Whether every planned step completed.
    pub fn is_success(&self) -> bool {
        self.failed.is_none()
    }

    /// Whether the plan was empty.
    pub fn is_noop(&self) -> bool {
        self.completed.is_empty() && self.failed.is_none()
    }

    /// Identifiers of completed steps, in order.
    pub fn completed_identifiers(&self) -> Vec<&str> {
        self.completed.iter().map(|o| o.identifier.as_str()).collect()
    }

    /// Whether any step ran without transactional protection.
    pub fn has_non_atomic_steps(&self) -> bool {
        self.completed.iter().any(|o| !o.atomic)
    }
}

/// Runs migration commands against one backend and one source.
pub struct Migrator<'a, B> {
    backend: &'a B,
    source: &'a dyn MigrationSource,
}

impl<'a, B> Migrator<'a, B>
where
    B: SchemaStore + RecordStore,
{
    /// Create a migrator.
    pub fn new(backend: &'a B, source: &'a dyn MigrationSource) -> Self {
        Self { backend, source }
    }

    /// Create the ledger if it is missing. Returns true if it was created.
    pub fn init(&self) -> Result<bool, MigrationError> {
        let created = self.backend.initialize()?;
        if created {
            tracing::info!("migration ledger initialized");
        } else {
            tracing::info!("migration ledger already initialized");
        }
        Ok(created)
    }

    /// Load the current definitions.
    pub fn definitions(&self) -> Result<Vec<MigrationDefinition>, MigrationError> {
        load_from(self.source)
    }

    /// Compute an upgrade plan without running it.
    pub fn plan_upgrade(&self, target: Option<&str>) -> Result<MigrationPlan, MigrationError> {
        let definitions = self.definitions()?;
        if let Some(target) = target {
            check_target(&definitions, target)?;
        }
        self.backend.initialize()?;
        let records = self.backend.list()?;
        let plan = MigrationPlan::upgrade(&definitions, &records, target)?;
        log_warnings(&plan.warnings);
        Ok(plan)
    }

    /// Compute a rollback plan without running it.
    pub fn plan_rollback(&self, target: &RollbackTarget) -> Result<MigrationPlan, MigrationError> {
        let definitions = self.definitions()?;
        if let RollbackTarget::To(target) = target {
            check_target(&definitions, target)?;
        }
        self.backend.initialize()?;
        let records = self.backend.list()?;
        let plan = MigrationPlan::rollback(&definitions, &records, target)?;
        log_warnings(&plan.warnings);
        Ok(plan)
    }

    /// Apply pending migrations in order, stopping at the first failure.
    ///
    /// Loader, ledger and planning errors are returned before anything is
    /// changed. A failing unit is reported in the returned report; the units
    /// before it stay applied.
    pub fn upgrade(&self, target: Option<&str>) -> Result<UpgradeReport, MigrationError> {
        let plan = self.plan_upgrade(target)?;
        if plan.is_empty() {
            tracing::info!("no pending migrations");
        } else {
            tracing::info!(count = plan.len(), "applying pending migrations");
        }
        Ok(self.run(plan))
    }

    /// Revert applied migrations, most recent first, stopping at the first
    /// failure.
    pub fn rollback(&self, target: &RollbackTarget) -> Result<RollbackReport, MigrationError> {
        let plan = self.plan_rollback(target)?;
        if plan.is_empty() {
            tracing::info!("no migrations to roll back");
        } else {
            tracing::info!(count = plan.len(), "reverting migrations");
        }
        Ok(self.run(plan))
    }

    /// Report the state of every definition and orphaned record.
    pub fn status(&self) -> Result<StatusReport, MigrationError> {
        let definitions = self.definitions()?;
        self.backend.initialize()?;
        let records = self.backend.list()?;
        Ok(StatusReport::compute(&definitions, &records))
    }

    fn run(&self, plan: MigrationPlan) -> RunReport {
        let mut executor = MigrationExecutor::new(self.backend);
        let (completed, error) = executor.execute(&plan);

        let failed = error.map(|error| {
            let identifier = plan
                .steps
                .get(completed.len())
                .map(|step| step.definition.identifier.clone())
                .unwrap_or_default();
            FailedStep { identifier, error }
        });
        let not_run = match failed {
            Some(_) => plan
                .steps
                .iter()
                .skip(completed.len() + 1)
                .map(|step| step.definition.identifier.clone())
                .collect(),
            None => Vec::new(),
        };

        RunReport {
            direction: plan.direction,
            completed,
            failed,
            not_run,
            warnings: plan.warnings,
        }
    }
}

/// Fail with `UnknownTarget` unless a definition has this identifier.
fn check_target(definitions: &[MigrationDefinition], target: &str) -> Result<(), MigrationError> {
    if definitions.iter().any(|d| d.identifier == target) {
        Ok(())
    } else {
        Err(MigrationError::UnknownTarget {
            identifier: target.to_string(),
        })
    }
}

fn log_warnings(warnings: &[PlanWarning]) {
    for warning in warnings {
        tracing::warn!(identifier = %warning.identifier(), "{}", warning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::migration::loader::SourceEntry;
    use crate::migration::planner::MigrationStatus;
    use std::cell::RefCell;

    struct StaticSource {
        entries: RefCell<Vec<SourceEntry>>,
    }

    impl StaticSource {
        fn new(tables: &[(&str, &str)]) -> Self {
            let source = Self {
                entries: RefCell::new(Vec::new()),
            };
            for (identifier, table) in tables {
                source.add(identifier, table);
            }
            source
        }

        fn add(&self, identifier: &str, table: &str) {
            self.entries.borrow_mut().push(SourceEntry::new(
                format!("{identifier}.sql"),
                format!(
                    "-- migrate:up\nCREATE TABLE {table} (id INTEGER PRIMARY KEY);\n\
                     -- migrate:down\nDROP TABLE {table};\n"
                ),
            ));
        }

        fn remove(&self, identifier: &str) {
            let name = format!("{identifier}.sql");
            self.entries.borrow_mut().retain(|e| e.name != name);
        }
    }

    impl MigrationSource for StaticSource {
        fn entries(&self) -> Result<Vec<SourceEntry>, MigrationError> {
            Ok(self.entries.borrow().clone())
        }

        fn location(&self) -> String {
            "static".to_string()
        }
    }

    fn farm_source() -> StaticSource {
        StaticSource::new(&[
            ("2024010200_create_nodes", "nodes"),
            ("2024010100_create_farms", "farms"),
        ])
    }

    #[test]
    fn test_init_is_idempotent() {
        let backend = MemoryBackend::new();
        let source = farm_source();
        let migrator = Migrator::new(&backend, &source);

        assert!(migrator.init().unwrap());
        assert!(!migrator.init().unwrap());
    }

    #[test]
    fn test_upgrade_then_status() {
        let backend = MemoryBackend::new();
        let source = farm_source();
        let migrator = Migrator::new(&backend, &source);

        let report = migrator.upgrade(None).unwrap();
        assert!(report.is_success());
        assert_eq!(
            report.completed_identifiers(),
            vec!["2024010100_create_farms", "2024010200_create_nodes"]
        );
        assert!(!report.has_non_atomic_steps());

        let status = migrator.status().unwrap();
        assert_eq!(status.pending_count(), 0);
        assert_eq!(status.drift_count(), 0);
    }

    #[test]
    fn test_second_upgrade_is_noop() {
        let backend = MemoryBackend::new();
        let source = farm_source();
        let migrator = Migrator::new(&backend, &source);

        migrator.upgrade(None).unwrap();
        let records = backend.list().unwrap();
        let executed = backend.executed_operations();

        let report = migrator.upgrade(None).unwrap();
        assert!(report.is_noop());
        assert_eq!(backend.list().unwrap(), records);
        assert_eq!(backend.executed_operations(), executed);
    }

    #[test]
    fn test_upgrade_stops_at_first_failure() {
        let backend = MemoryBackend::new();
        let source = farm_source();
        source.add("2024010300_create_readings", "readings");
        backend.fail_on("nodes");

        let migrator = Migrator::new(&backend, &source);
        let report = migrator.upgrade(None).unwrap();

        assert!(!report.is_success());
        assert_eq!(report.completed_identifiers(), vec!["2024010100_create_farms"]);
        let failed = report.failed.as_ref().unwrap();
        assert_eq!(failed.identifier, "2024010200_create_nodes");
        assert!(matches!(
            failed.error,
            MigrationError::MigrationApplyFailed { .. }
        ));
        assert_eq!(report.not_run, vec!["2024010300_create_readings"]);

        let status = migrator.status().unwrap();
        assert_eq!(
            status.status_of("2024010100_create_farms"),
            Some(MigrationStatus::Applied)
        );
        assert_eq!(
            status.status_of("2024010200_create_nodes"),
            Some(MigrationStatus::Pending)
        );
        assert_eq!(
            status.status_of("2024010300_create_readings"),
            Some(MigrationStatus::Pending)
        );
        assert_eq!(backend.schema(), vec!["table farms"]);

        // Fix and resume: already-applied units are skipped.
        backend.clear_fault();
        let resumed = migrator.upgrade(None).unwrap();
        assert_eq!(
            resumed.completed_identifiers(),
            vec!["2024010200_create_nodes", "2024010300_create_readings"]
        );
    }

    #[test]
    fn test_rollback_steps() {
        let backend = MemoryBackend::new();
        let source = farm_source();
        let migrator = Migrator::new(&backend, &source);
        migrator.upgrade(None).unwrap();

        let report = migrator.rollback(&RollbackTarget::Steps(1)).unwrap();
        assert_eq!(report.direction, Direction::Down);
        assert_eq!(report.completed_identifiers(), vec!["2024010200_create_nodes"]);
        assert_eq!(backend.schema(), vec!["table farms"]);

        let status = migrator.status().unwrap();
        assert_eq!(
            status.status_of("2024010100_create_farms"),
            Some(MigrationStatus::Applied)
        );
        assert_eq!(
            status.status_of("2024010200_create_nodes"),
            Some(MigrationStatus::Pending)
        );
    }

    #[test]
    fn test_orphaned_record_is_reported_not_planned() {
        let backend = MemoryBackend::new();
        let source = farm_source();
        let migrator = Migrator::new(&backend, &source);
        migrator.upgrade(None).unwrap();

        source.remove("2024010200_create_nodes");

        let status = migrator.status().unwrap();
        assert_eq!(
            status.status_of("2024010200_create_nodes"),
            Some(MigrationStatus::OrphanedRecord)
        );

        let report = migrator.rollback(&RollbackTarget::Steps(1)).unwrap();
        assert_eq!(report.completed_identifiers(), vec!["2024010100_create_farms"]);
        assert_eq!(
            report.warnings,
            vec![PlanWarning::OrphanedRecord {
                identifier: "2024010200_create_nodes".to_string()
            }]
        );
    }

    #[test]
    fn test_loader_errors_abort_before_mutation() {
        let backend = MemoryBackend::new();
        let source = farm_source();
        source.entries.borrow_mut().push(SourceEntry::new(
            "2024010300_broken.sql",
            "CREATE TABLE broken (id INTEGER);",
        ));

        let migrator = Migrator::new(&backend, &source);
        let result = migrator.upgrade(None);

        assert!(matches!(
            result,
            Err(MigrationError::DefinitionParseError { .. })
        ));
        assert!(backend.schema().is_empty());
        assert!(!backend.is_initialized().unwrap());
    }

    #[test]
    fn test_unknown_upgrade_target() {
        let backend = MemoryBackend::new();
        let source = farm_source();
        let migrator = Migrator::new(&backend, &source);

        let result = migrator.upgrade(Some("2099010100_future"));
        assert!(matches!(result, Err(MigrationError::UnknownTarget { .. })));
        assert!(!backend.is_initialized().unwrap());

        let result = migrator.rollback(&RollbackTarget::To("2099010100_future".to_string()));
        assert!(matches!(result, Err(MigrationError::UnknownTarget { .. })));
        assert!(!backend.is_initialized().unwrap());
        assert!(backend.schema().is_empty());
    }
}
