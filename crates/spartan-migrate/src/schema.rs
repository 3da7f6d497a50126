//! Schema store collaborator interface.

use crate::error::Error;
use crate::migration::Operation;

/// A target database that schema operations are executed against.
///
/// The executor drives one transaction per migration unit through this
/// interface. Methods take `&self` so the same handle can be shared with a
/// [`RecordStore`](crate::migration::RecordStore) that writes into the same
/// open transaction.
pub trait SchemaStore {
    /// Open a transaction. Nested transactions are not supported.
    fn begin_transaction(&self) -> Result<(), Error>;

    /// Execute a single schema operation.
    fn execute(&self, operation: &Operation) -> Result<(), Error>;

    /// Commit the open transaction.
    fn commit(&self) -> Result<(), Error>;

    /// Roll back the open transaction.
    fn rollback(&self) -> Result<(), Error>;

    /// Whether multi-statement transactions are atomic on this store.
    ///
    /// When false, `begin_transaction`/`commit`/`rollback` are accepted but
    /// executed operations take effect immediately.
    fn supports_transactions(&self) -> bool {
        true
    }
}
