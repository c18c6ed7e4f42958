//! Error types for the migration engine
//!
//! Graph and diff errors are raised before any database mutation. Runner and
//! executor errors abort the node that was in flight and halt the plan.

use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::node::NodeId;

/// Result type alias for migration operations
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Failure reported by a backend connection
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Statement failed: {message} (statement: {statement})")]
    Statement { statement: String, message: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Row decoding error: {0}")]
    Decode(String),
}

impl From<sqlx::Error> for BackendError {
    fn from(err: sqlx::Error) -> Self {
        BackendError::Database(err.to_string())
    }
}

/// Error taxonomy of the migration engine
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Migration '{node}' depends on unknown migration '{dependency}'")]
    UnknownDependency { node: NodeId, dependency: NodeId },

    #[error("Cyclic dependency detected: {}", join_ids(.cycle, " -> "))]
    CyclicDependency { cycle: Vec<NodeId> },

    #[error(
        "Divergent history in namespace '{namespace}': leaves {}; add a merge migration",
        join_ids(.leaves, ", ")
    )]
    DivergentHistory { namespace: String, leaves: Vec<NodeId> },

    #[error("Migration '{0}' is already part of the graph")]
    DuplicateNode(NodeId),

    #[error("Invalid migration '{node}': {reason}")]
    InvalidNode { node: NodeId, reason: String },

    #[error("Migration '{node}' is applied but its dependency '{dependency}' is not")]
    InconsistentHistory { node: NodeId, dependency: NodeId },

    #[error("Applied migration '{node}' was edited after it was applied (recorded checksum {recorded}, current {current})")]
    ChecksumMismatch {
        node: NodeId,
        recorded: String,
        current: String,
    },

    #[error("Ambiguous rename of '{table}.{column}': candidates {}", .candidates.join(", "))]
    AmbiguousRename {
        table: String,
        column: String,
        candidates: Vec<String>,
    },

    #[error("Invalid schema declaration: {0}")]
    InvalidDeclaration(String),

    #[error("Cannot apply '{operation}': {reason}")]
    InvalidOperation { operation: String, reason: String },

    #[error("'{operation}' cannot be rendered for {dialect}")]
    Unsupported { dialect: String, operation: String },

    #[error("Unknown migration target '{0}'")]
    UnknownTarget(String),

    #[error("Operation '{operation}' is not reversible")]
    NotReversible { operation: String },

    #[error("Another migration is in progress on '{target}'")]
    MigrationInProgress { target: String },

    #[error("Migration '{node}' exceeded its timeout of {timeout:?}")]
    Timeout { node: NodeId, timeout: Duration },

    #[error("Operation '{operation}' failed: {source}")]
    OperationFailed {
        operation: String,
        #[source]
        source: BackendError,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("Migration error: {0}")]
    Migration(String),
}

impl MigrationError {
    /// Create a new invalid operation error
    pub fn invalid_operation(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidOperation {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error was raised before anything touched the database
    pub fn is_planning_error(&self) -> bool {
        matches!(
            self,
            MigrationError::UnknownDependency { .. }
                | MigrationError::CyclicDependency { .. }
                | MigrationError::DivergentHistory { .. }
                | MigrationError::DuplicateNode(_)
                | MigrationError::InvalidNode { .. }
                | MigrationError::AmbiguousRename { .. }
                | MigrationError::InvalidDeclaration(_)
                | MigrationError::UnknownTarget(_)
        )
    }
}

impl From<serde_json::Error> for MigrationError {
    fn from(err: serde_json::Error) -> Self {
        MigrationError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for MigrationError {
    fn from(err: serde_yaml::Error) -> Self {
        MigrationError::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for MigrationError {
    fn from(err: sqlx::Error) -> Self {
        MigrationError::Backend(err.into())
    }
}

fn join_ids(ids: &[NodeId], separator: &str) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(separator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_every_node() {
        let err = MigrationError::CyclicDependency {
            cycle: vec![
                NodeId::new("app", "0001_a"),
                NodeId::new("app", "0002_b"),
                NodeId::new("app", "0001_a"),
            ],
        };

        assert_eq!(
            err.to_string(),
            "Cyclic dependency detected: app.0001_a -> app.0002_b -> app.0001_a"
        );
        assert!(err.is_planning_error());
    }

    #[test]
    fn test_operation_failure_keeps_backend_source() {
        let err = MigrationError::OperationFailed {
            operation: "Add column age to person".to_string(),
            source: BackendError::Statement {
                statement: "ALTER TABLE person ADD COLUMN age INTEGER".to_string(),
                message: "permission denied".to_string(),
            },
        };

        assert!(err.to_string().contains("Add column age to person"));
        assert!(err.to_string().contains("permission denied"));
        assert!(std::error::Error::source(&err).is_some());
        assert!(!err.is_planning_error());
    }
}
