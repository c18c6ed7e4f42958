//! In-process backend
//!
//! Journals executed statements instead of running them and keeps applied
//! markers in memory, with the same transaction and lock semantics as a real
//! database: nothing a connection does inside a transaction is visible to
//! other connections until commit, and abort discards it. Statement failures
//! and delays can be injected, which makes it the backend of choice for
//! exercising the runner.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::core::*;
use crate::error::BackendError;
use crate::node::NodeId;
use crate::sql::SqlDialect;
use crate::state::AppliedMigration;

type AppliedKey = (String, NodeId);

#[derive(Debug, Default)]
struct Shared {
    statements: Vec<String>,
    applied: BTreeMap<AppliedKey, AppliedMigration>,
    store_created: bool,
    locks: HashSet<i64>,
    failures: Vec<String>,
}

/// Uncommitted work of one connection
#[derive(Debug, Default)]
struct Pending {
    statements: Vec<String>,
    applied: BTreeMap<AppliedKey, Option<AppliedMigration>>,
    store_created: bool,
}

/// Shared in-memory database; clones refer to the same data
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    shared: Arc<Mutex<Shared>>,
    dialect: SqlDialect,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::with_dialect(SqlDialect::PostgreSQL)
    }

    /// Database rendering statements for `dialect`
    pub fn with_dialect(dialect: SqlDialect) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            dialect,
        }
    }

    /// Open a new connection
    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection {
            database: self.clone(),
            pending: None,
            held_locks: HashSet::new(),
            statement_delay: None,
        }
    }

    /// Fail every statement containing `pattern`
    pub fn fail_on(&self, pattern: impl Into<String>) {
        self.shared().failures.push(pattern.into());
    }

    pub fn clear_failures(&self) {
        self.shared().failures.clear();
    }

    /// Statements committed so far, in order
    pub fn committed_statements(&self) -> Vec<String> {
        self.shared().statements.clone()
    }

    /// Committed applied markers of one target
    pub fn applied(&self, target: &str) -> Vec<NodeId> {
        self.shared()
            .applied
            .keys()
            .filter(|(t, _)| t == target)
            .map(|(_, id)| id.clone())
            .collect()
    }

    pub fn is_locked(&self, key: i64) -> bool {
        self.shared().locks.contains(&key)
    }

    /// Overwrite a committed marker, bypassing transactions
    pub fn tamper_checksum(&self, target: &str, node: &NodeId, checksum: impl Into<String>) {
        if let Some(record) = self
            .shared()
            .applied
            .get_mut(&(target.to_string(), node.clone()))
        {
            record.checksum = checksum.into();
        }
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Connection to a `MemoryDatabase`
#[derive(Debug)]
pub struct MemoryConnection {
    database: MemoryDatabase,
    pending: Option<Pending>,
    held_locks: HashSet<i64>,
    statement_delay: Option<Duration>,
}

impl MemoryConnection {
    /// Sleep this long in every statement
    pub fn with_statement_delay(mut self, delay: Duration) -> Self {
        self.statement_delay = Some(delay);
        self
    }

    pub fn database(&self) -> &MemoryDatabase {
        &self.database
    }

    pub fn in_transaction(&self) -> bool {
        self.pending.is_some()
    }

    pub(crate) fn store_exists(&self) -> bool {
        let pending = self.pending.as_ref().map(|p| p.store_created).unwrap_or(false);
        pending || self.database.shared().store_created
    }

    pub(crate) fn create_store(&mut self) {
        match self.pending.as_mut() {
            Some(pending) => pending.store_created = true,
            None => self.database.shared().store_created = true,
        }
    }

    /// Applied markers of `target` as seen from this connection
    pub(crate) fn applied_view(&self, target: &str) -> Vec<AppliedMigration> {
        let mut view: BTreeMap<AppliedKey, AppliedMigration> = self
            .database
            .shared()
            .applied
            .iter()
            .filter(|((t, _), _)| t == target)
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect();

        if let Some(pending) = &self.pending {
            for (key, change) in pending.applied.iter().filter(|((t, _), _)| t == target) {
                match change {
                    Some(record) => view.insert(key.clone(), record.clone()),
                    None => view.remove(key),
                };
            }
        }

        view.into_values().collect()
    }

    pub(crate) fn write_applied(&mut self, target: &str, node: &NodeId, record: Option<AppliedMigration>) {
        let key = (target.to_string(), node.clone());
        match self.pending.as_mut() {
            Some(pending) => {
                pending.applied.insert(key, record);
            }
            None => {
                let mut shared = self.database.shared();
                match record {
                    Some(record) => shared.applied.insert(key, record),
                    None => shared.applied.remove(&key),
                };
            }
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if self.held_locks.is_empty() {
            return;
        }
        let mut shared = self.database.shared();
        for key in self.held_locks.drain() {
            shared.locks.remove(&key);
        }
    }
}

#[async_trait]
impl SchemaConnection for MemoryConnection {
    fn dialect(&self) -> SqlDialect {
        self.database.dialect
    }

    async fn begin(&mut self) -> Result<(), BackendError> {
        if self.pending.is_some() {
            return Err(BackendError::Transaction("Transaction already open".to_string()));
        }
        self.pending = Some(Pending::default());
        Ok(())
    }

    async fn execute(&mut self, sql: &str, _params: &[DatabaseValue]) -> Result<u64, BackendError> {
        if let Some(delay) = self.statement_delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self
            .database
            .shared()
            .failures
            .iter()
            .find(|pattern| sql.contains(pattern.as_str()))
            .cloned();
        if let Some(pattern) = failure {
            return Err(BackendError::Statement {
                statement: sql.to_string(),
                message: format!("injected failure on '{}'", pattern),
            });
        }

        match self.pending.as_mut() {
            Some(pending) => pending.statements.push(sql.to_string()),
            None => self.database.shared().statements.push(sql.to_string()),
        }
        Ok(0)
    }

    async fn commit(&mut self) -> Result<(), BackendError> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| BackendError::Transaction("No transaction to commit".to_string()))?;

        let mut shared = self.database.shared();
        shared.statements.extend(pending.statements);
        shared.store_created |= pending.store_created;
        for (key, change) in pending.applied {
            match change {
                Some(record) => shared.applied.insert(key, record),
                None => shared.applied.remove(&key),
            };
        }
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), BackendError> {
        self.pending = None;
        Ok(())
    }

    async fn try_lock(&mut self, key: i64) -> Result<bool, BackendError> {
        if self.held_locks.contains(&key) {
            return Ok(true);
        }
        let acquired = self.database.shared().locks.insert(key);
        if acquired {
            self.held_locks.insert(key);
        }
        Ok(acquired)
    }

    async fn unlock(&mut self, key: i64) -> Result<(), BackendError> {
        if self.held_locks.remove(&key) {
            self.database.shared().locks.remove(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commit_and_abort_visibility() {
        let db = MemoryDatabase::new();
        let mut conn = db.connect();

        conn.begin().await.unwrap();
        conn.execute("CREATE TABLE a (id INTEGER)", &[]).await.unwrap();
        assert!(db.committed_statements().is_empty());
        conn.commit().await.unwrap();
        assert_eq!(db.committed_statements(), vec!["CREATE TABLE a (id INTEGER)".to_string()]);

        conn.begin().await.unwrap();
        conn.execute("CREATE TABLE b (id INTEGER)", &[]).await.unwrap();
        conn.abort().await.unwrap();
        assert_eq!(db.committed_statements().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let db = MemoryDatabase::new();
        db.fail_on("DROP TABLE");
        let mut conn = db.connect();

        let err = conn.execute("DROP TABLE person", &[]).await.unwrap_err();
        assert!(matches!(err, BackendError::Statement { .. }));
        assert!(conn.execute("SELECT 1", &[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_locks_are_shared_and_released_on_drop() {
        let db = MemoryDatabase::new();
        let mut first = db.connect();
        let mut second = db.connect();

        assert!(first.try_lock(42).await.unwrap());
        assert!(!second.try_lock(42).await.unwrap());
        assert!(db.is_locked(42));

        drop(first);
        assert!(!db.is_locked(42));
        assert!(second.try_lock(42).await.unwrap());
        second.unlock(42).await.unwrap();
        assert!(!db.is_locked(42));
    }
}
