//! # elif-migrate: Schema Migrations for elif.rs
//!
//! Migrations are nodes of a dependency graph spanning namespaces. The diff
//! engine compares a declared schema against the state projected from the
//! graph and proposes the next node; the runner applies or reverts nodes
//! against a target database, one transaction per node, under an advisory
//! lock.

pub mod backends;
pub mod config;
pub mod diff;
pub mod error;
pub mod executor;
pub mod graph;
pub mod loader;
pub mod node;
pub mod operation;
pub mod runner;
pub mod schema;
pub mod sql;
pub mod state;

pub use backends::{
    DatabaseRow, DatabaseValue, MemoryConnection, MemoryDatabase, PostgresConnection, SchemaConnection,
    SqlConnection,
};
pub use config::{ConfigError, LockMode, MigrationConfig};
pub use diff::{merge_node, DiffEngine, DiffOptions, RenameHint};
pub use error::{BackendError, MigrationError, MigrationResult};
pub use executor::Executor;
pub use graph::MigrationGraph;
pub use loader::MigrationManager;
pub use node::{MigrationNode, NodeId};
pub use operation::Operation;
pub use runner::{
    CancellationFlag, MigrationPlan, MigrationReport, MigrationRunner, MigrationTarget, NodeState, NodeStatus,
    PlanDirection, PlanStep, RunnerOptions,
};
pub use schema::{
    ColumnDefinition, ColumnType, ForeignKeyDefinition, IndexDefinition, ReferentialAction, SchemaDeclaration,
    SchemaState, TableDefinition, TableState,
};
pub use sql::{split_statements, SqlDialect};
pub use state::{AppliedMigration, MemoryStateStore, SqlStateStore, StateStore, TargetDatabase};
