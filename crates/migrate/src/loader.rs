//! Migration Manager - file system operations for migration nodes
//!
//! Nodes live at `<migrations_dir>/<namespace>/<name>.json`. Artifacts are
//! never overwritten once written.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::MigrationConfig;
use crate::error::{MigrationError, MigrationResult};
use crate::graph::MigrationGraph;
use crate::node::MigrationNode;

/// Migration manager for writing and loading migration nodes
pub struct MigrationManager {
    config: MigrationConfig,
}

impl Default for MigrationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationManager {
    /// Create a new migration manager with default configuration
    pub fn new() -> Self {
        Self::with_config(MigrationConfig::default())
    }

    pub fn with_config(config: MigrationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn node_path(&self, node: &MigrationNode) -> PathBuf {
        self.config
            .migrations_dir
            .join(&node.namespace)
            .join(format!("{}.json", node.name))
    }

    /// Persist a new node, refusing to replace an existing artifact
    pub fn write_node(&self, node: &MigrationNode) -> MigrationResult<PathBuf> {
        let path = self.node_path(node);
        if path.exists() {
            return Err(MigrationError::Migration(format!(
                "Migration file {} already exists; write a new migration instead of editing it",
                path.display()
            )));
        }

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut content = serde_json::to_string_pretty(node)?;
        content.push('\n');
        fs::write(&path, content)?;

        debug!("Wrote migration {} to {}", node.id(), path.display());
        Ok(path)
    }

    /// Load every node, namespaces and names in sorted order
    pub fn load_nodes(&self) -> MigrationResult<Vec<MigrationNode>> {
        let root = &self.config.migrations_dir;
        if !root.exists() {
            return Ok(Vec::new());
        }

        let mut nodes = Vec::new();
        for namespace_dir in sorted_entries(root)? {
            if !namespace_dir.is_dir() {
                continue;
            }
            for path in sorted_entries(&namespace_dir)? {
                if path.extension().map_or(false, |ext| ext == "json") {
                    nodes.push(self.parse_node_file(&namespace_dir, &path)?);
                }
            }
        }

        debug!("Loaded {} migration(s) from {}", nodes.len(), root.display());
        Ok(nodes)
    }

    /// Load every node and integrate them as one batch
    pub fn load_graph(&self) -> MigrationResult<MigrationGraph> {
        let mut graph = MigrationGraph::new();
        graph.integrate_all(self.load_nodes()?)?;
        Ok(graph)
    }

    fn parse_node_file(&self, namespace_dir: &Path, path: &Path) -> MigrationResult<MigrationNode> {
        let content = fs::read_to_string(path)?;
        let node: MigrationNode = serde_json::from_str(&content).map_err(|e| {
            MigrationError::Serialization(format!("{}: {}", path.display(), e))
        })?;

        let namespace = namespace_dir.file_name().and_then(|s| s.to_str());
        let name = path.file_stem().and_then(|s| s.to_str());
        if namespace != Some(node.namespace.as_str()) || name != Some(node.name.as_str()) {
            return Err(MigrationError::Migration(format!(
                "Migration file {} declares {}, which does not match its location",
                path.display(),
                node.id()
            )));
        }

        Ok(node)
    }
}

fn sorted_entries(dir: &Path) -> MigrationResult<Vec<PathBuf>> {
    let mut paths = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeId;
    use crate::operation::Operation;
    use crate::schema::{ColumnDefinition, ColumnType, TableDefinition};

    fn manager(dir: &Path) -> MigrationManager {
        MigrationManager::with_config(MigrationConfig {
            migrations_dir: dir.to_path_buf(),
            ..Default::default()
        })
    }

    fn initial() -> MigrationNode {
        MigrationNode::new("people", "0001_initial").add_operation(Operation::CreateTable {
            table: TableDefinition::new("person").column(ColumnDefinition::new("name", ColumnType::Varchar(20))),
        })
    }

    #[test]
    fn test_write_and_load_graph() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let path = manager.write_node(&initial()).unwrap();
        assert!(path.ends_with("people/0001_initial.json"));
        manager
            .write_node(
                &MigrationNode::new("people", "0002_age").add_dependency(NodeId::new("people", "0001_initial")),
            )
            .unwrap();

        let nodes = manager.load_nodes().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0], initial());

        let graph = manager.load_graph().unwrap();
        assert_eq!(graph.leaves("people").unwrap(), vec![NodeId::new("people", "0002_age")]);
    }

    #[test]
    fn test_existing_artifact_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        manager.write_node(&initial()).unwrap();
        let err = manager.write_node(&MigrationNode::new("people", "0001_initial")).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(manager.load_nodes().unwrap()[0], initial());
    }

    #[test]
    fn test_misplaced_artifact_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let path = manager.write_node(&initial()).unwrap();
        fs::rename(&path, path.with_file_name("0005_renamed.json")).unwrap();

        assert!(manager.load_nodes().is_err());
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir.path().join("missing"));
        assert!(manager.load_graph().unwrap().is_empty());
    }
}
