//! Schema store backends.
//!
//! Each backend implements both [`SchemaStore`](crate::schema::SchemaStore)
//! and [`RecordStore`](crate::migration::RecordStore) over one connection.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;
