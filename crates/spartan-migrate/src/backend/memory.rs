//! In-memory backend with fault injection.
//!
//! Models the schema as an ordered set of named objects: `CREATE <kind>
//! [IF NOT EXISTS] <name>` adds one, `DROP <kind> [IF EXISTS] <name>`
//! removes one, and any other statement is accepted without effect. Faults
//! can be injected to fail a chosen operation.

use crate::error::Error;
use crate::migration::{
    compare_identifiers, MigrationError, MigrationRecord, Operation, RecordStore,
};
use crate::schema::SchemaStore;
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
enum Fault {
    /// Fail the operation after `remaining` more successful ones (one-shot).
    AfterOperations { remaining: usize },
    /// Fail every operation whose text contains the pattern.
    Matching(String),
}

#[derive(Debug, Clone, Default)]
struct Committed {
    ledger: bool,
    objects: Vec<String>,
    records: BTreeMap<String, MigrationRecord>,
}

#[derive(Debug, Default)]
struct MemoryState {
    live: Committed,
    snapshot: Option<Committed>,
    in_transaction: bool,
    fault: Option<Fault>,
    executed: usize,
}

/// Schema and record store held entirely in memory.
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    transactional: bool,
}

impl MemoryBackend {
    /// Create a transactional backend.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            transactional: true,
        }
    }

    /// Create a backend whose rollbacks undo nothing.
    pub fn non_transactional() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            transactional: false,
        }
    }

    /// Fail the operation that follows the next `n` successful ones.
    pub fn fail_after(&self, n: usize) {
        self.state.lock().fault = Some(Fault::AfterOperations { remaining: n });
    }

    /// Fail every operation containing `pattern`.
    pub fn fail_on(&self, pattern: impl Into<String>) {
        self.state.lock().fault = Some(Fault::Matching(pattern.into()));
    }

    /// Remove any injected fault.
    pub fn clear_fault(&self) {
        self.state.lock().fault = None;
    }

    /// Schema objects (`"<kind> <name>"`) in creation order.
    pub fn schema(&self) -> Vec<String> {
        self.state.lock().live.objects.clone()
    }

    /// Total operations executed successfully, including rolled-back ones.
    pub fn executed_operations(&self) -> usize {
        self.state.lock().executed
    }

    fn apply_statement(objects: &mut Vec<String>, sql: &str) -> Result<(), Error> {
        let words: Vec<String> = sql
            .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
            .filter(|w| !w.is_empty())
            .map(str::to_ascii_lowercase)
            .collect();
        let words: Vec<&str> = words.iter().map(String::as_str).collect();

        match words.as_slice() {
            ["create", "unique", "index", rest @ ..] => Self::create(objects, "index", rest),
            ["create", kind, rest @ ..] => Self::create(objects, kind, rest),
            ["drop", kind, rest @ ..] => Self::drop(objects, kind, rest),
            _ => Ok(()),
        }
    }

    fn create(objects: &mut Vec<String>, kind: &str, rest: &[&str]) -> Result<(), Error> {
        let (if_not_exists, name) = match rest {
            ["if", "not", "exists", name, ..] => (true, *name),
            [name, ..] => (false, *name),
            [] => return Err(Error::InvalidData(format!("create {kind} without a name"))),
        };
        let object = format!("{kind} {name}");
        if objects.contains(&object) {
            if if_not_exists {
                return Ok(());
            }
            return Err(Error::InvalidData(format!("{object} already exists")));
        }
        objects.push(object);
        Ok(())
    }

    fn drop(objects: &mut Vec<String>, kind: &str, rest: &[&str]) -> Result<(), Error> {
        let (if_exists, name) = match rest {
            ["if", "exists", name, ..] => (true, *name),
            [name, ..] => (false, *name),
            [] => return Err(Error::InvalidData(format!("drop {kind} without a name"))),
        };
        let object = format!("{kind} {name}");
        match objects.iter().position(|o| *o == object) {
            Some(index) => {
                objects.remove(index);
                Ok(())
            }
            None if if_exists => Ok(()),
            None => Err(Error::InvalidData(format!("no such {object}"))),
        }
    }

    fn ensure_ledger(state: &MemoryState) -> Result<(), MigrationError> {
        if state.live.ledger {
            Ok(())
        } else {
            Err(Error::InvalidData("ledger table does not exist".to_string()).into())
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaStore for MemoryBackend {
    fn begin_transaction(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.in_transaction {
            return Err(Error::Transaction("transaction already open".to_string()));
        }
        state.in_transaction = true;
        if self.transactional {
            state.snapshot = Some(state.live.clone());
        }
        Ok(())
    }

    fn execute(&self, operation: &Operation) -> Result<(), Error> {
        let mut state = self.state.lock();

        let injected = match &mut state.fault {
            Some(Fault::AfterOperations { remaining: 0 }) => true,
            Some(Fault::AfterOperations { remaining }) => {
                *remaining -= 1;
                false
            }
            Some(Fault::Matching(pattern)) => operation.as_str().contains(pattern.as_str()),
            None => false,
        };
        if injected {
            if matches!(state.fault, Some(Fault::AfterOperations { .. })) {
                state.fault = None;
            }
            return Err(Error::InjectedFault(operation.to_string()));
        }

        Self::apply_statement(&mut state.live.objects, operation.as_str())?;
        state.executed += 1;
        Ok(())
    }

    fn commit(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        if !state.in_transaction {
            return Err(Error::Transaction("commit without an open transaction".to_string()));
        }
        state.in_transaction = false;
        state.snapshot = None;
        Ok(())
    }

    fn rollback(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        if !state.in_transaction {
            return Err(Error::Transaction("rollback without an open transaction".to_string()));
        }
        state.in_transaction = false;
        if let Some(snapshot) = state.snapshot.take() {
            state.live = snapshot;
        }
        Ok(())
    }

    fn supports_transactions(&self) -> bool {
        self.transactional
    }
}

impl RecordStore for MemoryBackend {
    fn initialize(&self) -> Result<bool, MigrationError> {
        let mut state = self.state.lock();
        if state.live.ledger {
            return Ok(false);
        }
        state.live.ledger = true;
        Ok(true)
    }

    fn is_initialized(&self) -> Result<bool, MigrationError> {
        Ok(self.state.lock().live.ledger)
    }

    fn list(&self) -> Result<Vec<MigrationRecord>, MigrationError> {
        let state = self.state.lock();
        Self::ensure_ledger(&state)?;
        let mut records: Vec<MigrationRecord> = state.live.records.values().cloned().collect();
        records.sort_by(|a, b| compare_identifiers(&a.identifier, &b.identifier));
        Ok(records)
    }

    fn insert(&self, record: &MigrationRecord) -> Result<(), MigrationError> {
        let mut state = self.state.lock();
        Self::ensure_ledger(&state)?;
        if state.live.records.contains_key(&record.identifier) {
            return Err(MigrationError::DuplicateRecord {
                identifier: record.identifier.clone(),
            });
        }
        state
            .live
            .records
            .insert(record.identifier.clone(), record.clone());
        Ok(())
    }

    fn remove(&self, identifier: &str) -> Result<(), MigrationError> {
        let mut state = self.state.lock();
        Self::ensure_ledger(&state)?;
        match state.live.records.remove(identifier) {
            Some(_) => Ok(()),
            None => Err(MigrationError::RecordNotFound {
                identifier: identifier.to_string(),
            }),
        }
    }
}
