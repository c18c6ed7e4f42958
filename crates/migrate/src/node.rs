//! Migration nodes - named, ordered bundles of operations
//!
//! A node is immutable once persisted. Corrections are new nodes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::{MigrationError, MigrationResult};
use crate::operation::Operation;

/// Identity of a migration node, displayed as `namespace.name`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId {
    pub namespace: String,
    pub name: String,
}

impl NodeId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

impl FromStr for NodeId {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
                Ok(NodeId::new(namespace, name))
            }
            _ => Err(MigrationError::Migration(format!(
                "invalid migration identity '{}', expected 'namespace.name'",
                s
            ))),
        }
    }
}

impl TryFrom<String> for NodeId {
    type Error = MigrationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeId> for String {
    fn from(value: NodeId) -> Self {
        value.to_string()
    }
}

/// A migration node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationNode {
    /// Namespace (usually the owning application or module)
    pub namespace: String,
    /// Name, unique within the namespace (e.g. "0001_initial")
    pub name: String,
    /// Explicit initial flag; inferred from the dependencies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<bool>,
    /// Nodes that must be applied first
    #[serde(default)]
    pub dependencies: Vec<NodeId>,
    /// Operations, applied in order
    #[serde(default)]
    pub operations: Vec<Operation>,
}

impl MigrationNode {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            initial: None,
            dependencies: Vec::new(),
            operations: Vec::new(),
        }
    }

    pub fn add_operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn add_dependency(mut self, dependency: NodeId) -> Self {
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    pub fn initial(mut self, initial: bool) -> Self {
        self.initial = Some(initial);
        self
    }

    pub fn id(&self) -> NodeId {
        NodeId::new(self.namespace.clone(), self.name.clone())
    }

    /// Explicit flag, or no dependency within its own namespace
    pub fn is_initial(&self) -> bool {
        match self.initial {
            Some(initial) => initial,
            None => !self
                .dependencies
                .iter()
                .any(|dependency| dependency.namespace == self.namespace),
        }
    }

    pub fn is_reversible(&self) -> bool {
        self.operations.iter().all(Operation::is_reversible)
    }

    /// First operation that has no inverse
    pub fn irreversible_operation(&self) -> Option<&Operation> {
        self.operations.iter().find(|op| !op.is_reversible())
    }

    /// Leading number of the name ("0003_add_age" -> 3)
    pub fn ordinal(&self) -> Option<u32> {
        let digits: String = self.name.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse().ok()
    }

    /// SHA-256 of the canonical JSON form of the operations
    pub fn checksum(&self) -> MigrationResult<String> {
        let canonical = serde_json::to_vec(&self.operations)?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }
}
