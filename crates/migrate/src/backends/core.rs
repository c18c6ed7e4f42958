//! Core backend capability traits
//!
//! The runner needs very little from a database: a dialect to render DDL, a
//! transaction it can begin, execute into, commit or abort, and an advisory
//! lock scoped to the target database. Table-backed state stores also read
//! rows back through `SqlConnection`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::BackendError;
use crate::sql::SqlDialect;

/// Transactional execute/commit/abort capability of a backend
#[async_trait]
pub trait SchemaConnection: Send {
    /// Dialect used to render operations for this connection
    fn dialect(&self) -> SqlDialect;

    /// Begin a transaction
    async fn begin(&mut self) -> Result<(), BackendError>;

    /// Execute a statement and return the affected rows count
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> Result<u64, BackendError>;

    /// Commit the open transaction
    async fn commit(&mut self) -> Result<(), BackendError>;

    /// Roll back the open transaction
    async fn abort(&mut self) -> Result<(), BackendError>;

    /// Try to take the advisory lock `key` without waiting
    async fn try_lock(&mut self, key: i64) -> Result<bool, BackendError>;

    /// Release the advisory lock `key`
    async fn unlock(&mut self, key: i64) -> Result<(), BackendError>;
}

/// Connection that can also read rows
#[async_trait]
pub trait SqlConnection: SchemaConnection {
    /// Execute a query and return the result rows
    async fn fetch_all(&mut self, sql: &str, params: &[DatabaseValue]) -> Result<Vec<DatabaseRow>, BackendError>;
}

/// Parameter and column values exchanged with a backend
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    Bool(bool),
    Int64(i64),
    String(String),
    DateTime(DateTime<Utc>),
}

impl DatabaseValue {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        DatabaseValue::String(value.to_string())
    }
}

impl From<String> for DatabaseValue {
    fn from(value: String) -> Self {
        DatabaseValue::String(value)
    }
}

impl From<DateTime<Utc>> for DatabaseValue {
    fn from(value: DateTime<Utc>) -> Self {
        DatabaseValue::DateTime(value)
    }
}

/// A fetched row, values addressed by column name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatabaseRow {
    columns: Vec<(String, DatabaseValue)>,
}

impl DatabaseRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: DatabaseValue) -> Self {
        self.columns.push((column.into(), value));
        self
    }

    pub fn get(&self, column: &str) -> Option<&DatabaseValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn get_string(&self, column: &str) -> Result<String, BackendError> {
        match self.get(column) {
            Some(DatabaseValue::String(value)) => Ok(value.clone()),
            other => Err(decode_error(column, "a string", other)),
        }
    }

    pub fn get_datetime(&self, column: &str) -> Result<DateTime<Utc>, BackendError> {
        match self.get(column) {
            Some(DatabaseValue::DateTime(value)) => Ok(*value),
            Some(DatabaseValue::String(value)) => DateTime::parse_from_rfc3339(value)
                .map(|parsed| parsed.with_timezone(&Utc))
                .map_err(|e| BackendError::Decode(format!("column '{}': {}", column, e))),
            other => Err(decode_error(column, "a timestamp", other)),
        }
    }
}

fn decode_error(column: &str, expected: &str, found: Option<&DatabaseValue>) -> BackendError {
    match found {
        None => BackendError::Decode(format!("column '{}' not found", column)),
        Some(value) => BackendError::Decode(format!(
            "column '{}' holds {:?}, expected {}",
            column, value, expected
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_accessors() {
        let now = Utc::now();
        let row = DatabaseRow::new()
            .with("namespace", "people".into())
            .with("applied_at", DatabaseValue::DateTime(now))
            .with("legacy_at", "2024-03-01T10:00:00+00:00".into());

        assert_eq!(row.get_string("namespace").unwrap(), "people");
        assert_eq!(row.get_datetime("applied_at").unwrap(), now);
        assert!(row.get_datetime("legacy_at").is_ok());
        assert!(row.get_string("applied_at").is_err());
        assert!(matches!(row.get_string("missing"), Err(BackendError::Decode(_))));
        assert_eq!(row.column_names(), vec!["namespace", "applied_at", "legacy_at"]);
    }
}
