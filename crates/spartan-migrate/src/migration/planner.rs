//! Migration planning.
//!
//! Diffs loaded definitions against the ledger to decide what to apply or
//! revert. Plans are computed fresh for every command and never persisted.

use super::definition::{compare_identifiers, MigrationDefinition};
use super::error::MigrationError;
use super::record::MigrationRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Direction of a plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Run forward operations.
    Up,
    /// Run reverse operations.
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
        }
    }
}

/// Non-fatal findings surfaced while planning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanWarning {
    /// A record exists whose unit is no longer in the source.
    OrphanedRecord {
        /// The orphaned identifier.
        identifier: String,
    },
    /// A unit changed after it was applied.
    DefinitionDrifted {
        /// The drifted identifier.
        identifier: String,
        /// Checksum stored in the ledger.
        recorded: String,
        /// Checksum of the current unit.
        current: String,
    },
}

impl PlanWarning {
    /// The identifier this warning is about.
    pub fn identifier(&self) -> &str {
        match self {
            PlanWarning::OrphanedRecord { identifier }
            | PlanWarning::DefinitionDrifted { identifier, .. } => identifier,
        }
    }
}

impl fmt::Display for PlanWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanWarning::OrphanedRecord { identifier } => {
                write!(f, "orphaned record {identifier}: no matching migration unit")
            }
            PlanWarning::DefinitionDrifted {
                identifier,
                recorded,
                current,
            } => write!(
                f,
                "migration {identifier} changed since it was applied (recorded {}, current {})",
                short(recorded),
                short(current)
            ),
        }
    }
}

fn short(checksum: &str) -> &str {
    checksum.get(..12).unwrap_or(checksum)
}

/// How far a rollback should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackTarget {
    /// Revert the N most recently applied migrations.
    Steps(usize),
    /// Revert every applied migration after this identifier.
    To(String),
}

/// One unit of work in a plan.
#[derive(Debug, Clone)]
pub struct PlanStep {
    /// The unit to run.
    pub definition: MigrationDefinition,
    /// Which operation list to run.
    pub direction: Direction,
}

/// An ordered list of migrations to apply or revert.
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    /// Direction shared by every step.
    pub direction: Direction,
    /// Steps in execution order.
    pub steps: Vec<PlanStep>,
    /// Drift found while planning.
    pub warnings: Vec<PlanWarning>,
}

impl MigrationPlan {
    /// Plan an upgrade: every unapplied definition, ascending.
    ///
    /// With a `target`, only identifiers up to and including it are planned.
    /// The target must name a loaded definition.
    pub fn upgrade(
        definitions: &[MigrationDefinition],
        records: &[MigrationRecord],
        target: Option<&str>,
    ) -> Result<Self, MigrationError> {
        if let Some(target) = target {
            ensure_known(definitions, target)?;
        }

        let applied: HashSet<&str> = records.iter().map(|r| r.identifier.as_str()).collect();

        let mut pending: Vec<&MigrationDefinition> = definitions
            .iter()
            .filter(|def| !applied.contains(def.identifier.as_str()))
            .filter(|def| match target {
                Some(target) => compare_identifiers(&def.identifier, target).is_le(),
                None => true,
            })
            .collect();
        pending.sort_by(|a, b| a.order(b));

        Ok(Self {
            direction: Direction::Up,
            steps: pending
                .into_iter()
                .map(|def| PlanStep {
                    definition: def.clone(),
                    direction: Direction::Up,
                })
                .collect(),
            warnings: detect_drift(definitions, records),
        })
    }

    /// Plan a rollback: applied migrations, most recent first.
    ///
    /// Orphaned records are never planned. Drifted units are reverted with
    /// their current reverse operations.
    pub fn rollback(
        definitions: &[MigrationDefinition],
        records: &[MigrationRecord],
        target: &RollbackTarget,
    ) -> Result<Self, MigrationError> {
        let by_id: HashMap<&str, &MigrationDefinition> = definitions
            .iter()
            .map(|def| (def.identifier.as_str(), def))
            .collect();

        let mut applied: Vec<&MigrationDefinition> = records
            .iter()
            .filter_map(|r| by_id.get(r.identifier.as_str()).copied())
            .collect();
        applied.sort_by(|a, b| b.order(a));

        let selected: Vec<&MigrationDefinition> = match target {
            RollbackTarget::Steps(n) => applied.into_iter().take(*n).collect(),
            RollbackTarget::To(target) => {
                ensure_known(definitions, target)?;
                applied
                    .into_iter()
                    .take_while(|def| compare_identifiers(&def.identifier, target).is_gt())
                    .collect()
            }
        };

        Ok(Self {
            direction: Direction::Down,
            steps: selected
                .into_iter()
                .map(|def| PlanStep {
                    definition: def.clone(),
                    direction: Direction::Down,
                })
                .collect(),
            warnings: detect_drift(definitions, records),
        })
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Identifiers in execution order.
    pub fn identifiers(&self) -> Vec<&str> {
        self.steps
            .iter()
            .map(|s| s.definition.identifier.as_str())
            .collect()
    }
}

fn ensure_known(definitions: &[MigrationDefinition], target: &str) -> Result<(), MigrationError> {
    if definitions.iter().any(|def| def.identifier == target) {
        Ok(())
    } else {
        Err(MigrationError::UnknownTarget {
            identifier: target.to_string(),
        })
    }
}

/// Find orphaned records and drifted definitions, ordered by identifier.
pub fn detect_drift(
    definitions: &[MigrationDefinition],
    records: &[MigrationRecord],
) -> Vec<PlanWarning> {
    let by_id: HashMap<&str, &MigrationDefinition> = definitions
        .iter()
        .map(|def| (def.identifier.as_str(), def))
        .collect();

    let mut warnings: Vec<PlanWarning> = records
        .iter()
        .filter_map(|record| match by_id.get(record.identifier.as_str()) {
            None => Some(PlanWarning::OrphanedRecord {
                identifier: record.identifier.clone(),
            }),
            Some(def) if def.checksum != record.checksum => Some(PlanWarning::DefinitionDrifted {
                identifier: record.identifier.clone(),
                recorded: record.checksum.clone(),
                current: def.checksum.clone(),
            }),
            Some(_) => None,
        })
        .collect();

    warnings.sort_by(|a, b| compare_identifiers(a.identifier(), b.identifier()));
    warnings
}

/// Per-migration state as reported by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Recorded, and the checksum matches.
    Applied,
    /// Not recorded.
    Pending,
    /// Recorded, but the unit changed since.
    Drifted,
    /// Recorded, but the unit no longer exists.
    OrphanedRecord,
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationStatus::Applied => write!(f, "applied"),
            MigrationStatus::Pending => write!(f, "pending"),
            MigrationStatus::Drifted => write!(f, "drifted"),
            MigrationStatus::OrphanedRecord => write!(f, "orphaned_record"),
        }
    }
}

/// One row of a status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEntry {
    /// Migration identifier.
    pub identifier: String,
    /// Its state.
    pub status: MigrationStatus,
    /// When it was applied, if recorded.
    pub applied_at: Option<DateTime<Utc>>,
}

/// Per-definition state plus orphaned records.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    /// Rows ordered by identifier.
    pub entries: Vec<StatusEntry>,
    /// Drift warnings.
    pub warnings: Vec<PlanWarning>,
}

impl StatusReport {
    /// Compute status from definitions and records.
    pub fn compute(definitions: &[MigrationDefinition], records: &[MigrationRecord]) -> Self {
        let by_id: HashMap<&str, &MigrationRecord> = records
            .iter()
            .map(|r| (r.identifier.as_str(), r))
            .collect();
        let known: HashSet<&str> = definitions.iter().map(|d| d.identifier.as_str()).collect();

        let mut entries: Vec<StatusEntry> = definitions
            .iter()
            .map(|def| match by_id.get(def.identifier.as_str()) {
                Some(record) => StatusEntry {
                    identifier: def.identifier.clone(),
                    status: if record.checksum == def.checksum {
                        MigrationStatus::Applied
                    } else {
                        MigrationStatus::Drifted
                    },
                    applied_at: Some(record.applied_at),
                },
                None => StatusEntry {
                    identifier: def.identifier.clone(),
                    status: MigrationStatus::Pending,
                    applied_at: None,
                },
            })
            .collect();

        entries.extend(
            records
                .iter()
                .filter(|r| !known.contains(r.identifier.as_str()))
                .map(|r| StatusEntry {
                    identifier: r.identifier.clone(),
                    status: MigrationStatus::OrphanedRecord,
                    applied_at: Some(r.applied_at),
                }),
        );
        entries.sort_by(|a, b| compare_identifiers(&a.identifier, &b.identifier));

        Self {
            entries,
            warnings: detect_drift(definitions, records),
        }
    }

    /// Count of rows in a given state.
    pub fn count(&self, status: MigrationStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }

    /// Number of pending migrations.
    pub fn pending_count(&self) -> usize {
        self.count(MigrationStatus::Pending)
    }

    /// Number of drifted units plus orphaned records.
    pub fn drift_count(&self) -> usize {
        self.count(MigrationStatus::Drifted) + self.count(MigrationStatus::OrphanedRecord)
    }

    /// Status of one identifier.
    pub fn status_of(&self, identifier: &str) -> Option<MigrationStatus> {
        self.entries
            .iter()
            .find(|e| e.identifier == identifier)
            .map(|e| e.status)
    }
}
