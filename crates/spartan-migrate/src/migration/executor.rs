//! Migration executor - applies and reverts single migration units.
//!
//! Every unit runs in its own transaction together with its ledger write,
//! so a unit is either fully applied and recorded or not at all.

use super::definition::{MigrationDefinition, Operation};
use super::error::MigrationError;
use super::planner::{Direction, MigrationPlan};
use super::record::{MigrationRecord, RecordStore};
use crate::schema::SchemaStore;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Lifecycle of one migration identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationState {
    /// Not applied.
    Unapplied,
    /// Forward operations in progress.
    Applying,
    /// Applied and recorded.
    Applied,
    /// Reverse operations in progress.
    Reverting,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationState::Unapplied => write!(f, "unapplied"),
            MigrationState::Applying => write!(f, "applying"),
            MigrationState::Applied => write!(f, "applied"),
            MigrationState::Reverting => write!(f, "reverting"),
        }
    }
}

/// Result of running one unit.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// The unit that ran.
    pub identifier: String,
    /// Which way it ran.
    pub direction: Direction,
    /// Number of operations executed.
    pub operations: usize,
    /// Whether the unit ran inside a real transaction.
    pub atomic: bool,
    /// Wall-clock time spent.
    pub elapsed: Duration,
}

/// Why a unit failed inside its transaction.
enum StepFailure {
    /// A schema operation failed.
    Operation { index: usize, cause: String },
    /// The ledger write failed.
    Record(MigrationError),
}

/// Applies and reverts migration units against a backend.
pub struct MigrationExecutor<'a, B> {
    backend: &'a B,
    states: HashMap<String, MigrationState>,
}

impl<'a, B> MigrationExecutor<'a, B>
where
    B: SchemaStore + RecordStore,
{
    /// Create an executor over a backend that is both the schema store and
    /// the record store.
    pub fn new(backend: &'a B) -> Self {
        Self {
            backend,
            states: HashMap::new(),
        }
    }

    /// Apply a unit's forward operations and record it.
    pub fn apply(
        &mut self,
        definition: &MigrationDefinition,
    ) -> Result<StepOutcome, MigrationError> {
        self.run(definition, Direction::Up)
    }

    /// Revert a unit's reverse operations and remove its record.
    pub fn revert(
        &mut self,
        definition: &MigrationDefinition,
    ) -> Result<StepOutcome, MigrationError> {
        if !definition.is_reversible() {
            return Err(MigrationError::MigrationRevertFailed {
                identifier: definition.identifier.clone(),
                cause: "migration has no reverse operations".to_string(),
            });
        }
        self.run(definition, Direction::Down)
    }

    /// Run a single plan step.
    pub fn run_step(
        &mut self,
        definition: &MigrationDefinition,
        direction: Direction,
    ) -> Result<StepOutcome, MigrationError> {
        match direction {
            Direction::Up => self.apply(definition),
            Direction::Down => self.revert(definition),
        }
    }

    /// Execute a plan in order, stopping at the first failure.
    ///
    /// Returns the outcomes of the completed steps and the failure, if any.
    /// Steps completed before a failure stay committed.
    pub fn execute(
        &mut self,
        plan: &MigrationPlan,
    ) -> (Vec<StepOutcome>, Option<MigrationError>) {
        let mut completed = Vec::with_capacity(plan.len());
        for step in &plan.steps {
            match self.run_step(&step.definition, step.direction) {
                Ok(outcome) => completed.push(outcome),
                Err(err) => return (completed, Some(err)),
            }
        }
        (completed, None)
    }

    /// Last known state of an identifier touched by this executor.
    pub fn state_of(&self, identifier: &str) -> Option<MigrationState> {
        self.states.get(identifier).copied()
    }

    fn transition(&mut self, identifier: &str, state: MigrationState) {
        let previous = self.states.insert(identifier.to_string(), state);
        tracing::debug!(
            identifier,
            from = %previous.map_or("unknown".to_string(), |s| s.to_string()),
            to = %state,
            "migration state transition"
        );
    }

    fn run(
        &mut self,
        definition: &MigrationDefinition,
        direction: Direction,
    ) -> Result<StepOutcome, MigrationError> {
        let identifier = definition.identifier.as_str();
        let (in_progress, done, undone) = match direction {
            Direction::Up => (
                MigrationState::Applying,
                MigrationState::Applied,
                MigrationState::Unapplied,
            ),
            Direction::Down => (
                MigrationState::Reverting,
                MigrationState::Unapplied,
                MigrationState::Applied,
            ),
        };
        let operations = match direction {
            Direction::Up => &definition.forward,
            Direction::Down => &definition.reverse,
        };

        let atomic = self.backend.supports_transactions();
        if !atomic {
            tracing::warn!(
                identifier,
                direction = %direction,
                "schema store does not support transactions; running without atomicity"
            );
        }

        let started = Instant::now();
        self.transition(identifier, in_progress);

        if let Err(err) = self.backend.begin_transaction() {
            self.transition(identifier, undone);
            return Err(failed(direction, identifier, err.to_string()));
        }

        let body = self.run_body(definition, direction, operations);
        let result = match body {
            Ok(()) => self
                .backend
                .commit()
                .map_err(|err| self.abort(direction, identifier, err.to_string(), None, atomic)),
            Err(StepFailure::Operation { index, cause }) => {
                let cause = format!("operation {} of {}: {}", index + 1, operations.len(), cause);
                Err(self.abort(direction, identifier, cause, Some(index), atomic))
            }
            Err(StepFailure::Record(err)) => {
                let abort = self.abort(direction, identifier, err.to_string(), None, atomic);
                match err {
                    MigrationError::DuplicateRecord { .. }
                    | MigrationError::RecordNotFound { .. } => Err(err),
                    _ => Err(abort),
                }
            }
        };

        match result {
            Ok(()) => {
                self.transition(identifier, done);
                let elapsed = started.elapsed();
                tracing::info!(
                    identifier,
                    direction = %direction,
                    operations = operations.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    atomic,
                    "migration {}",
                    if direction == Direction::Up { "applied" } else { "reverted" }
                );
                Ok(StepOutcome {
                    identifier: identifier.to_string(),
                    direction,
                    operations: operations.len(),
                    atomic,
                    elapsed,
                })
            }
            Err(err) => {
                self.transition(identifier, undone);
                tracing::error!(
                    identifier,
                    direction = %direction,
                    error = %err,
                    "migration failed"
                );
                Err(err)
            }
        }
    }

    fn run_body(
        &self,
        definition: &MigrationDefinition,
        direction: Direction,
        operations: &[Operation],
    ) -> Result<(), StepFailure> {
        for (index, operation) in operations.iter().enumerate() {
            self.backend
                .execute(operation)
                .map_err(|err| StepFailure::Operation {
                    index,
                    cause: err.to_string(),
                })?;
        }

        match direction {
            Direction::Up => self
                .backend
                .insert(&MigrationRecord::applied_now(definition))
                .map_err(StepFailure::Record),
            Direction::Down => self
                .backend
                .remove(&definition.identifier)
                .map_err(StepFailure::Record),
        }
    }

    /// Roll back the open transaction and build the error to report.
    fn abort(
        &self,
        direction: Direction,
        identifier: &str,
        cause: String,
        failed_index: Option<usize>,
        atomic: bool,
    ) -> MigrationError {
        let mut cause = cause;
        if let Err(err) = self.backend.rollback() {
            cause.push_str(&format!("; rollback also failed: {err}"));
        }
        if !atomic {
            if let Some(index) = failed_index {
                cause.push_str(&format!(
                    "; schema store is not transactional, \
                     {index} earlier operation(s) were not undone"
                ));
            }
        }
        failed(direction, identifier, cause)
    }
}

fn failed(direction: Direction, identifier: &str, cause: String) -> MigrationError {
    match direction {
        Direction::Up => MigrationError::MigrationApplyFailed {
            identifier: identifier.to_string(),
            cause,
        },
        Direction::Down => MigrationError::MigrationRevertFailed {
            identifier: identifier.to_string(),
            cause,
        },
    }
}
