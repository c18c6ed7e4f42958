//! Operation executor
//!
//! Runs inside the caller's transaction; never commits or aborts.

use tracing::debug;

use crate::backends::SchemaConnection;
use crate::error::{MigrationError, MigrationResult};
use crate::operation::Operation;
use crate::sql::SqlDialect;

/// Applies and reverses single operations through a connection
#[derive(Debug, Clone, Default)]
pub struct Executor;

impl Executor {
    pub fn new() -> Self {
        Self
    }

    /// Statements the operation renders to for `dialect`
    pub fn statements(&self, operation: &Operation, dialect: SqlDialect) -> MigrationResult<Vec<String>> {
        dialect.render(operation)
    }

    pub async fn apply<C>(&self, operation: &Operation, conn: &mut C) -> MigrationResult<()>
    where
        C: SchemaConnection + ?Sized,
    {
        let statements = self.statements(operation, conn.dialect())?;
        debug!("{} ({} statement(s))", operation.describe(), statements.len());

        for statement in &statements {
            debug!("Executing: {}", statement);
            conn.execute(statement, &[])
                .await
                .map_err(|source| MigrationError::OperationFailed {
                    operation: operation.describe(),
                    source,
                })?;
        }

        Ok(())
    }

    /// Apply the inverse of `operation`
    pub async fn reverse<C>(&self, operation: &Operation, conn: &mut C) -> MigrationResult<()>
    where
        C: SchemaConnection + ?Sized,
    {
        let inverse = operation.inverse().ok_or_else(|| MigrationError::NotReversible {
            operation: operation.describe(),
        })?;
        self.apply(&inverse, conn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryDatabase;
    use crate::schema::{ColumnDefinition, ColumnType};

    fn add_age() -> Operation {
        Operation::AddColumn {
            table: "person".to_string(),
            column: ColumnDefinition::new("age", ColumnType::Integer).nullable(),
        }
    }

    #[tokio::test]
    async fn test_apply_and_reverse() {
        let db = MemoryDatabase::new();
        let mut conn = db.connect();
        let executor = Executor::new();

        executor.apply(&add_age(), &mut conn).await.unwrap();
        executor.reverse(&add_age(), &mut conn).await.unwrap();

        assert_eq!(
            db.committed_statements(),
            vec![
                "ALTER TABLE \"person\" ADD COLUMN \"age\" INTEGER".to_string(),
                "ALTER TABLE \"person\" DROP COLUMN \"age\"".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_backend_failure_is_wrapped() {
        let db = MemoryDatabase::new();
        db.fail_on("ADD COLUMN");
        let mut conn = db.connect();

        let err = Executor::new().apply(&add_age(), &mut conn).await.unwrap_err();
        match err {
            MigrationError::OperationFailed { operation, .. } => {
                assert_eq!(operation, "Add column age to person");
            }
            other => panic!("expected OperationFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reverse_without_inverse() {
        let db = MemoryDatabase::new();
        let mut conn = db.connect();
        let op = Operation::DropColumn {
            table: "person".to_string(),
            column: "age".to_string(),
            definition: None,
        };

        let err = Executor::new().reverse(&op, &mut conn).await.unwrap_err();
        assert!(matches!(err, MigrationError::NotReversible { .. }));
        assert!(db.committed_statements().is_empty());
    }
}
