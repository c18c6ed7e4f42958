//! Database backends
//!
//! `SchemaConnection` is the narrow capability the runner and executor need;
//! `SqlConnection` adds row reads for the table-backed state store.

pub mod core;
pub mod memory;
pub mod postgres;

pub use self::core::{DatabaseRow, DatabaseValue, SchemaConnection, SqlConnection};
pub use self::memory::{MemoryConnection, MemoryDatabase};
pub use self::postgres::PostgresConnection;
