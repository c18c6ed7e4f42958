//! PostgreSQL backend implementation
//!
//! A single sqlx connection. Transactions are driven with plain
//! BEGIN/COMMIT/ROLLBACK so the runner can hold one connection for the
//! whole run, and the advisory lock is a session-level
//! `pg_try_advisory_lock`.

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgConnection, PgRow};
use sqlx::{Column, Connection, Executor, Postgres, Row, TypeInfo};
use tracing::debug;

use super::core::*;
use crate::error::BackendError;
use crate::sql::SqlDialect;

/// Migration connection to a PostgreSQL database
pub struct PostgresConnection {
    conn: PgConnection,
    in_transaction: bool,
}

impl PostgresConnection {
    /// Open a connection
    pub async fn connect(database_url: &str) -> Result<Self, BackendError> {
        match SqlDialect::from_url(database_url) {
            Some(SqlDialect::PostgreSQL) => {}
            Some(other) => {
                return Err(BackendError::Connection(format!(
                    "{} URLs are not supported, expected a PostgreSQL URL",
                    other
                )))
            }
            None => return Err(BackendError::Connection("Invalid PostgreSQL URL scheme".to_string())),
        }

        let conn = PgConnection::connect(database_url)
            .await
            .map_err(|e| BackendError::Connection(format!("Failed to connect to PostgreSQL: {}", e)))?;

        Ok(Self {
            conn,
            in_transaction: false,
        })
    }

    /// Close the connection
    pub async fn close(self) -> Result<(), BackendError> {
        self.conn.close().await.map_err(BackendError::from)
    }

    async fn simple(&mut self, sql: &str) -> Result<u64, BackendError> {
        let result = (&mut self.conn)
            .execute(sql)
            .await
            .map_err(|e| statement_error(sql, e))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SchemaConnection for PostgresConnection {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::PostgreSQL
    }

    async fn begin(&mut self) -> Result<(), BackendError> {
        if self.in_transaction {
            return Err(BackendError::Transaction("Transaction already open".to_string()));
        }
        self.simple("BEGIN").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> Result<u64, BackendError> {
        if params.is_empty() {
            return self.simple(sql).await;
        }

        let query = params
            .iter()
            .fold(sqlx::query(sql), |query, value| bind_database_value(query, value));
        let result = query
            .execute(&mut self.conn)
            .await
            .map_err(|e| statement_error(sql, e))?;
        Ok(result.rows_affected())
    }

    async fn commit(&mut self) -> Result<(), BackendError> {
        if !self.in_transaction {
            return Err(BackendError::Transaction("No transaction to commit".to_string()));
        }
        self.in_transaction = false;
        self.simple("COMMIT").await.map(|_| ())
    }

    async fn abort(&mut self) -> Result<(), BackendError> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        self.simple("ROLLBACK").await.map(|_| ())
    }

    async fn try_lock(&mut self, key: i64) -> Result<bool, BackendError> {
        let row = sqlx::query("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut self.conn)
            .await?;
        let acquired: bool = row.try_get(0)?;
        debug!("pg_try_advisory_lock({}) -> {}", key, acquired);
        Ok(acquired)
    }

    async fn unlock(&mut self, key: i64) -> Result<(), BackendError> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .fetch_one(&mut self.conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SqlConnection for PostgresConnection {
    async fn fetch_all(&mut self, sql: &str, params: &[DatabaseValue]) -> Result<Vec<DatabaseRow>, BackendError> {
        let query = params
            .iter()
            .fold(sqlx::query(sql), |query, value| bind_database_value(query, value));
        let rows = query
            .fetch_all(&mut self.conn)
            .await
            .map_err(|e| statement_error(sql, e))?;

        rows.iter().map(convert_row).collect()
    }
}

fn statement_error(sql: &str, err: sqlx::Error) -> BackendError {
    BackendError::Statement {
        statement: sql.to_string(),
        message: err.to_string(),
    }
}

/// Bind a DatabaseValue to a sqlx query
fn bind_database_value<'a>(
    query: sqlx::query::Query<'a, Postgres, PgArguments>,
    value: &DatabaseValue,
) -> sqlx::query::Query<'a, Postgres, PgArguments> {
    match value {
        DatabaseValue::Null => query.bind(Option::<String>::None),
        DatabaseValue::Bool(b) => query.bind(*b),
        DatabaseValue::Int64(i) => query.bind(*i),
        DatabaseValue::String(s) => query.bind(s.clone()),
        DatabaseValue::DateTime(dt) => query.bind(*dt),
    }
}

fn convert_row(row: &PgRow) -> Result<DatabaseRow, BackendError> {
    let mut converted = DatabaseRow::new();
    for (index, column) in row.columns().iter().enumerate() {
        converted = converted.with(column.name(), convert_value(row, index)?);
    }
    Ok(converted)
}

/// Convert a PostgreSQL column value to DatabaseValue
fn convert_value(row: &PgRow, index: usize) -> Result<DatabaseValue, BackendError> {
    let type_name = row.columns()[index].type_info().name().to_string();
    let decode = |e: sqlx::Error| BackendError::Decode(format!("column {} ({}): {}", index, type_name, e));

    let value = match type_name.as_str() {
        "BOOL" => row.try_get::<Option<bool>, _>(index).map_err(decode)?.map(DatabaseValue::Bool),
        "INT2" => row
            .try_get::<Option<i16>, _>(index)
            .map_err(decode)?
            .map(|v| DatabaseValue::Int64(v.into())),
        "INT4" => row
            .try_get::<Option<i32>, _>(index)
            .map_err(decode)?
            .map(|v| DatabaseValue::Int64(v.into())),
        "INT8" => row.try_get::<Option<i64>, _>(index).map_err(decode)?.map(DatabaseValue::Int64),
        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index)
            .map_err(decode)?
            .map(DatabaseValue::DateTime),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(index)
            .map_err(decode)?
            .map(|v| DatabaseValue::DateTime(v.and_utc())),
        _ => row.try_get::<Option<String>, _>(index).map_err(decode)?.map(DatabaseValue::String),
    };

    Ok(value.unwrap_or(DatabaseValue::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect_error(url: &str) -> String {
        match PostgresConnection::connect(url).await {
            Err(BackendError::Connection(message)) => message,
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("connected to {}", url),
        }
    }

    #[tokio::test]
    async fn test_connect_rejects_other_schemes() {
        assert!(connect_error("mysql://localhost/shop").await.contains("MySQL"));
        assert!(connect_error("localhost/shop").await.contains("scheme"));
    }
}
