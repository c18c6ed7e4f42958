//! Schema diffing
//!
//! Compares a declared schema with the snapshot obtained by replaying the
//! graph and synthesizes the operations that move one to the other. The
//! engine never executes anything.

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::error::{MigrationError, MigrationResult};
use crate::graph::MigrationGraph;
use crate::node::{MigrationNode, NodeId};
use crate::operation::Operation;
use crate::schema::{ColumnDefinition, SchemaDeclaration, SchemaState, TableDefinition, TableState};

/// Longest joined fragment used as a generated node name
const MAX_NAME_FRAGMENT: usize = 52;

/// Explicit rename hint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameHint {
    pub table: String,
    pub from: String,
    pub to: String,
}

/// Diff configuration
#[derive(Debug, Clone)]
pub struct DiffOptions {
    pub renames: Vec<RenameHint>,
    pub detect_renames: bool,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            renames: Vec::new(),
            detect_renames: true,
        }
    }
}

impl DiffOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat `table.from` -> `table.to` as a rename regardless of the heuristic
    pub fn rename(mut self, table: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.renames.push(RenameHint {
            table: table.into(),
            from: from.into(),
            to: to.into(),
        });
        self
    }

    pub fn detect_renames(mut self, enabled: bool) -> Self {
        self.detect_renames = enabled;
        self
    }
}

/// Operation buckets, emitted in dependency-safe order
#[derive(Default)]
struct Buckets {
    drop_foreign_keys: Vec<Operation>,
    drop_indexes: Vec<Operation>,
    create_tables: Vec<Operation>,
    table_changes: Vec<Operation>,
    drop_tables: Vec<Operation>,
    add_indexes: Vec<Operation>,
    add_foreign_keys: Vec<Operation>,
}

impl Buckets {
    fn into_operations(self) -> Vec<Operation> {
        let mut operations = self.drop_foreign_keys;
        operations.extend(self.drop_indexes);
        operations.extend(self.create_tables);
        operations.extend(self.table_changes);
        operations.extend(self.drop_tables);
        operations.extend(self.add_indexes);
        operations.extend(self.add_foreign_keys);
        operations
    }
}

/// Computes operations between a declared schema and a snapshot
#[derive(Debug, Clone, Default)]
pub struct DiffEngine {
    options: DiffOptions,
}

impl DiffEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: DiffOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &DiffOptions {
        &self.options
    }

    /// Operations moving `snapshot` to `desired`; every snapshot table absent
    /// from `desired` is dropped
    pub fn compute_operations(
        &self,
        desired: &SchemaDeclaration,
        snapshot: &SchemaState,
    ) -> MigrationResult<Vec<Operation>> {
        self.diff(desired, snapshot, &SchemaState::new())
    }

    /// Diff `desired` against `current`, the tables it owns. `external` holds
    /// tables owned elsewhere: they may be referenced but are never changed.
    fn diff(
        &self,
        desired: &SchemaDeclaration,
        current: &SchemaState,
        external: &SchemaState,
    ) -> MigrationResult<Vec<Operation>> {
        if let Some(table) = desired.tables.iter().find(|t| external.has_table(&t.name)) {
            return Err(MigrationError::InvalidDeclaration(format!(
                "table '{}' is owned by another namespace",
                table.name
            )));
        }
        let target = desired.to_state_with(external)?;

        if let Some(hint) = self
            .options
            .renames
            .iter()
            .find(|hint| !current.has_table(&hint.table) || !target.has_table(&hint.table))
        {
            return Err(unmatched_hint(hint));
        }

        let mut renames: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
        for (name, old) in &current.tables {
            if let (Some(new), Some(declared)) = (target.table(name), desired.find_table(name)) {
                let found = self.detect_renames(old, new, declared)?;
                if !found.is_empty() {
                    renames.insert(name.clone(), found);
                }
            }
        }

        // current schema with renames applied, so indexes and foreign keys
        // can be compared by name against the target
        let mut renamed = current.clone();
        for (table, pairs) in &renames {
            for (from, to) in pairs {
                let unique = current
                    .table(table)
                    .and_then(|t| t.column(from))
                    .map_or(false, |column| column.unique);
                Operation::RenameColumn {
                    table: table.clone(),
                    from: from.clone(),
                    to: to.clone(),
                    unique,
                }
                .state_forwards(&mut renamed)?;
            }
        }

        self.check_external_references(current, &target, external, &renames)?;

        let mut buckets = Buckets::default();

        for (name, old) in &current.tables {
            let Some(renamed_old) = renamed.table(name) else {
                continue;
            };
            match target.table(name) {
                None => {
                    for fk in old.foreign_keys.values() {
                        buckets.drop_foreign_keys.push(drop_foreign_key(name, fk.clone()));
                    }
                    for index in old.indexes.values() {
                        buckets.drop_indexes.push(drop_index(name, index.clone()));
                    }
                    let bare = TableDefinition {
                        indexes: Vec::new(),
                        foreign_keys: Vec::new(),
                        ..old.to_definition()
                    };
                    buckets.drop_tables.push(Operation::DropTable {
                        table: name.clone(),
                        definition: Some(bare),
                    });
                }
                Some(new) => {
                    for (index_name, index) in &renamed_old.indexes {
                        if new.indexes.get(index_name) != Some(index) {
                            if let Some(original) = old.indexes.get(index_name) {
                                buckets.drop_indexes.push(drop_index(name, original.clone()));
                            }
                        }
                    }
                    for (index_name, index) in &new.indexes {
                        if renamed_old.indexes.get(index_name) != Some(index) {
                            buckets.add_indexes.push(Operation::AddIndex {
                                table: name.clone(),
                                index: index.clone(),
                            });
                        }
                    }
                    for (fk_name, fk) in &renamed_old.foreign_keys {
                        if new.foreign_keys.get(fk_name) != Some(fk) {
                            if let Some(original) = old.foreign_keys.get(fk_name) {
                                buckets.drop_foreign_keys.push(drop_foreign_key(name, original.clone()));
                            }
                        }
                    }
                    for (fk_name, fk) in &new.foreign_keys {
                        if renamed_old.foreign_keys.get(fk_name) != Some(fk) {
                            buckets.add_foreign_keys.push(Operation::AddForeignKey {
                                table: name.clone(),
                                foreign_key: fk.clone(),
                            });
                        }
                    }

                    let declared_order = desired
                        .find_table(name)
                        .map(|t| t.columns.as_slice())
                        .unwrap_or_default();
                    let pairs = renames.get(name).map(Vec::as_slice).unwrap_or_default();
                    buckets
                        .table_changes
                        .extend(column_changes(name, pairs, renamed_old, new, declared_order));
                }
            }
        }

        for (name, new) in &target.tables {
            if current.has_table(name) {
                continue;
            }
            let columns = desired
                .find_table(name)
                .map(|t| t.columns.clone())
                .unwrap_or_else(|| new.columns.values().cloned().collect());
            buckets.create_tables.push(Operation::CreateTable {
                table: TableDefinition {
                    name: name.clone(),
                    columns,
                    indexes: Vec::new(),
                    foreign_keys: Vec::new(),
                },
            });
            for index in new.indexes.values() {
                buckets.add_indexes.push(Operation::AddIndex {
                    table: name.clone(),
                    index: index.clone(),
                });
            }
            for fk in new.foreign_keys.values() {
                buckets.add_foreign_keys.push(Operation::AddForeignKey {
                    table: name.clone(),
                    foreign_key: fk.clone(),
                });
            }
        }

        let operations = buckets.into_operations();
        debug!("Diff produced {} operation(s)", operations.len());
        Ok(operations)
    }

    /// Pairs (old name, new name) of renamed columns in one table
    fn detect_renames(
        &self,
        old: &TableState,
        new: &TableState,
        declared: &TableDefinition,
    ) -> MigrationResult<Vec<(String, String)>> {
        let mut removed: Vec<&ColumnDefinition> = old
            .columns
            .values()
            .filter(|column| !new.columns.contains_key(&column.name))
            .collect();
        let mut added: Vec<&ColumnDefinition> = declared
            .columns
            .iter()
            .filter(|column| !old.columns.contains_key(&column.name))
            .collect();

        let mut renames = Vec::new();

        for hint in self.options.renames.iter().filter(|hint| hint.table == old.name) {
            let from = removed.iter().position(|c| c.name == hint.from);
            let to = added.iter().position(|c| c.name == hint.to);
            match (from, to) {
                (Some(from), Some(to)) => {
                    renames.push((removed.remove(from).name.clone(), added.remove(to).name.clone()));
                }
                _ => return Err(unmatched_hint(hint)),
            }
        }

        if !self.options.detect_renames {
            return Ok(renames);
        }

        for column in &removed {
            let candidates = same_shape_names(column, &added);
            if candidates.len() > 1 {
                return Err(ambiguous(&old.name, &column.name, candidates));
            }
        }
        for column in &added {
            let candidates = same_shape_names(column, &removed);
            if candidates.len() > 1 {
                return Err(ambiguous(&old.name, &column.name, candidates));
            }
        }

        for column in &removed {
            if let [candidate] = same_shape_names(column, &added).as_slice() {
                renames.push((column.name.clone(), candidate.clone()));
            }
        }

        Ok(renames)
    }

    /// Tables owned elsewhere may not lose what they reference
    fn check_external_references(
        &self,
        current: &SchemaState,
        target: &SchemaState,
        external: &SchemaState,
        renames: &BTreeMap<String, Vec<(String, String)>>,
    ) -> MigrationResult<()> {
        for (table, fk) in external.tables.values().flat_map(|t| {
            t.foreign_keys.values().map(move |fk| (t.name.as_str(), fk))
        }) {
            let Some(current_table) = current.table(&fk.references_table) else {
                continue;
            };
            if !current_table.columns.contains_key(&fk.references_column) {
                continue;
            }
            let column = renames
                .get(&fk.references_table)
                .and_then(|pairs| pairs.iter().find(|(from, _)| *from == fk.references_column))
                .map(|(_, to)| to)
                .unwrap_or(&fk.references_column);
            let still_there = target
                .table(&fk.references_table)
                .map(|t| t.columns.contains_key(column))
                .unwrap_or(false);
            if !still_there {
                return Err(MigrationError::InvalidDeclaration(format!(
                    "'{}.{}' is still referenced by foreign key '{}' on '{}'",
                    fk.references_table, fk.references_column, fk.name, table
                )));
            }
        }
        Ok(())
    }

    /// Propose the next node of `namespace`, or `None` when the declaration
    /// matches the graph
    pub fn propose_node(
        &self,
        graph: &MigrationGraph,
        namespace: &str,
        desired: &SchemaDeclaration,
    ) -> MigrationResult<Option<MigrationNode>> {
        let leaves = graph.leaves(namespace)?;
        let snapshot = graph.project_state()?;
        let owners = graph.table_owners();
        let owned: BTreeSet<String> = owners
            .iter()
            .filter(|(_, owner)| owner.as_str() == namespace)
            .map(|(table, _)| table.clone())
            .collect();
        let (current, external) = snapshot.partition(&owned);

        let operations = self.diff(desired, &current, &external)?;
        if operations.is_empty() {
            return Ok(None);
        }

        let mut dependencies: Vec<NodeId> = leaves.clone();
        for referenced in operations.iter().flat_map(Operation::referenced_tables) {
            let Some(owner) = owners.get(referenced) else {
                continue;
            };
            if owner == namespace {
                continue;
            }
            for leaf in graph.leaves(owner)? {
                if !dependencies.contains(&leaf) {
                    dependencies.push(leaf);
                }
            }
        }

        let name = if leaves.is_empty() && graph.nodes_in(namespace).is_empty() {
            format!("{:04}_initial", next_ordinal(graph, namespace))
        } else {
            let fragments: Vec<String> = operations.iter().filter_map(Operation::name_fragment).collect();
            let joined = fragments.join("_");
            if joined.is_empty() || joined.len() > MAX_NAME_FRAGMENT {
                format!(
                    "{:04}_auto_{}",
                    next_ordinal(graph, namespace),
                    Utc::now().format("%Y%m%d_%H%M")
                )
            } else {
                format!("{:04}_{}", next_ordinal(graph, namespace), joined)
            }
        };

        let node = dependencies
            .into_iter()
            .fold(MigrationNode::new(namespace, name), MigrationNode::add_dependency);
        let node = operations.into_iter().fold(node, MigrationNode::add_operation);

        debug!("Proposed migration {} with {} operation(s)", node.id(), node.operations.len());
        Ok(Some(node))
    }
}

/// An empty node depending on every leaf of a diverged namespace, or `None`
/// when there is nothing to merge
pub fn merge_node(graph: &MigrationGraph, namespace: &str) -> MigrationResult<Option<MigrationNode>> {
    let candidates = graph.leaf_candidates(namespace);
    if candidates.len() <= 1 {
        return Ok(None);
    }

    let name = format!("{:04}_merge", next_ordinal(graph, namespace));
    Ok(Some(
        candidates
            .into_iter()
            .fold(MigrationNode::new(namespace, name), MigrationNode::add_dependency),
    ))
}

fn next_ordinal(graph: &MigrationGraph, namespace: &str) -> u32 {
    graph
        .nodes_in(namespace)
        .iter()
        .filter_map(|node| node.ordinal())
        .max()
        .unwrap_or(0)
        + 1
}

fn same_shape_names(column: &ColumnDefinition, pool: &[&ColumnDefinition]) -> Vec<String> {
    pool.iter()
        .filter(|other| other.same_shape(column))
        .map(|other| other.name.clone())
        .collect()
}

fn ambiguous(table: &str, column: &str, mut candidates: Vec<String>) -> MigrationError {
    candidates.sort();
    MigrationError::AmbiguousRename {
        table: table.to_string(),
        column: column.to_string(),
        candidates,
    }
}

fn unmatched_hint(hint: &RenameHint) -> MigrationError {
    MigrationError::InvalidDeclaration(format!(
        "rename hint {}.{} -> {} does not match a removed and an added column",
        hint.table, hint.from, hint.to
    ))
}

fn drop_index(table: &str, index: crate::schema::IndexDefinition) -> Operation {
    Operation::DropIndex {
        table: table.to_string(),
        name: index.name.clone(),
        definition: Some(index),
    }
}

fn drop_foreign_key(table: &str, fk: crate::schema::ForeignKeyDefinition) -> Operation {
    Operation::DropForeignKey {
        table: table.to_string(),
        name: fk.name.clone(),
        definition: Some(fk),
    }
}

/// Renames, then adds in declared order, then alters, then drops
fn column_changes(
    table: &str,
    renames: &[(String, String)],
    old: &TableState,
    new: &TableState,
    declared_order: &[ColumnDefinition],
) -> Vec<Operation> {
    let mut operations: Vec<Operation> = renames
        .iter()
        .map(|(from, to)| Operation::RenameColumn {
            table: table.to_string(),
            from: from.clone(),
            to: to.clone(),
            unique: old.column(to).map_or(false, |column| column.unique),
        })
        .collect();

    for column in declared_order {
        if !old.columns.contains_key(&column.name) {
            operations.push(Operation::AddColumn {
                table: table.to_string(),
                column: column.clone(),
            });
        }
    }

    for column in declared_order {
        if let Some(previous) = old.columns.get(&column.name) {
            if previous != column {
                operations.push(Operation::AlterColumn {
                    table: table.to_string(),
                    from: Some(previous.clone()),
                    to: column.clone(),
                });
            }
        }
    }

    for (name, column) in &old.columns {
        if !new.columns.contains_key(name) {
            operations.push(Operation::DropColumn {
                table: table.to_string(),
                column: name.clone(),
                definition: Some(column.clone()),
            });
        }
    }

    operations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnType, ForeignKeyDefinition, IndexDefinition};

    fn person(columns: Vec<ColumnDefinition>) -> TableDefinition {
        columns
            .into_iter()
            .fold(TableDefinition::new("person"), TableDefinition::column)
    }

    fn name_column() -> ColumnDefinition {
        ColumnDefinition::new("name", ColumnType::Varchar(20))
    }

    fn replay(start: &SchemaState, operations: &[Operation]) -> SchemaState {
        let mut state = start.clone();
        for op in operations {
            op.state_forwards(&mut state).unwrap();
        }
        state
    }

    #[test]
    fn test_create_table_from_empty_snapshot() {
        let desired = SchemaDeclaration::new().table(person(vec![name_column()]));
        let ops = DiffEngine::new()
            .compute_operations(&desired, &SchemaState::new())
            .unwrap();

        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], Operation::CreateTable { table } if table.name == "person"));
    }

    #[test]
    fn test_exclusive_match_becomes_rename() {
        let old = SchemaDeclaration::new()
            .table(person(vec![name_column()]))
            .to_state()
            .unwrap();
        let desired = SchemaDeclaration::new().table(person(vec![
            ColumnDefinition::new("person_name", ColumnType::Varchar(20)),
            ColumnDefinition::new("age", ColumnType::Integer).nullable(),
        ]));

        let ops = DiffEngine::new().compute_operations(&desired, &old).unwrap();

        assert_eq!(
            ops,
            vec![
                Operation::RenameColumn {
                    table: "person".to_string(),
                    from: "name".to_string(),
                    to: "person_name".to_string(),
                    unique: false,
                },
                Operation::AddColumn {
                    table: "person".to_string(),
                    column: ColumnDefinition::new("age", ColumnType::Integer).nullable(),
                },
            ]
        );
        assert_eq!(replay(&old, &ops), desired.to_state().unwrap());
    }

    #[test]
    fn test_ambiguous_rename_is_rejected() {
        let old = SchemaDeclaration::new()
            .table(person(vec![name_column()]))
            .to_state()
            .unwrap();
        let desired = SchemaDeclaration::new().table(person(vec![
            ColumnDefinition::new("first_name", ColumnType::Varchar(20)),
            ColumnDefinition::new("last_name", ColumnType::Varchar(20)),
        ]));

        let err = DiffEngine::new().compute_operations(&desired, &old).unwrap_err();
        match err {
            MigrationError::AmbiguousRename { table, column, candidates } => {
                assert_eq!(table, "person");
                assert_eq!(column, "name");
                assert_eq!(candidates, vec!["first_name".to_string(), "last_name".to_string()]);
            }
            other => panic!("expected an ambiguous rename, got {other:?}"),
        }

        let hinted = DiffEngine::with_options(DiffOptions::new().rename("person", "name", "first_name"))
            .compute_operations(&desired, &old)
            .unwrap();
        assert!(matches!(&hinted[0], Operation::RenameColumn { to, .. } if to == "first_name"));
        assert!(matches!(&hinted[1], Operation::AddColumn { column, .. } if column.name == "last_name"));
    }

    #[test]
    fn test_renames_can_be_disabled() {
        let old = SchemaDeclaration::new()
            .table(person(vec![name_column()]))
            .to_state()
            .unwrap();
        let desired =
            SchemaDeclaration::new().table(person(vec![ColumnDefinition::new("full_name", ColumnType::Varchar(20))]));

        let ops = DiffEngine::with_options(DiffOptions::new().detect_renames(false))
            .compute_operations(&desired, &old)
            .unwrap();
        assert!(matches!(&ops[0], Operation::AddColumn { .. }));
        assert!(matches!(&ops[1], Operation::DropColumn { definition: Some(_), .. }));

        let mistyped = DiffOptions::new().detect_renames(false).rename("person", "nmae", "full_name");
        let err = DiffEngine::with_options(mistyped)
            .compute_operations(&desired, &old)
            .unwrap_err();
        assert!(matches!(err, MigrationError::InvalidDeclaration(_)));

        let wrong_table = DiffOptions::new().rename("people", "name", "full_name");
        let err = DiffEngine::with_options(wrong_table)
            .compute_operations(&desired, &old)
            .unwrap_err();
        assert!(matches!(err, MigrationError::InvalidDeclaration(_)));

        let hinted = DiffOptions::new().detect_renames(false).rename("person", "name", "full_name");
        let hinted = DiffEngine::with_options(hinted)
            .compute_operations(&desired, &old)
            .unwrap();
        assert_eq!(hinted.len(), 1);
    }

    #[test]
    fn test_rename_of_unique_column_carries_constraint() {
        let old = SchemaDeclaration::new()
            .table(person(vec![name_column().unique()]))
            .to_state()
            .unwrap();
        let desired = SchemaDeclaration::new().table(person(vec![
            ColumnDefinition::new("full_name", ColumnType::Varchar(20)).unique()
        ]));

        let ops = DiffEngine::new().compute_operations(&desired, &old).unwrap();
        assert!(matches!(&ops[..], [Operation::RenameColumn { unique: true, .. }]));
        assert_eq!(replay(&old, &ops), desired.to_state().unwrap());

        let mismatched = Operation::RenameColumn {
            table: "person".to_string(),
            from: "name".to_string(),
            to: "full_name".to_string(),
            unique: false,
        };
        assert!(mismatched.state_forwards(&mut old.clone()).is_err());
    }

    #[test]
    fn test_alter_and_index_changes() {
        let old = SchemaDeclaration::new()
            .table(person(vec![name_column()]).index(IndexDefinition::new("person_name_idx", &["name"])))
            .to_state()
            .unwrap();
        let desired = SchemaDeclaration::new().table(
            person(vec![ColumnDefinition::new("name", ColumnType::Text).nullable()])
                .index(IndexDefinition::new("person_name_idx", &["name"]).unique()),
        );

        let ops = DiffEngine::new().compute_operations(&desired, &old).unwrap();
        assert!(matches!(&ops[0], Operation::DropIndex { definition: Some(_), .. }));
        assert!(matches!(&ops[1], Operation::AlterColumn { from: Some(_), .. }));
        assert!(matches!(&ops[2], Operation::AddIndex { index, .. } if index.unique));
        assert_eq!(replay(&old, &ops), desired.to_state().unwrap());
    }

    #[test]
    fn test_drop_ordering_with_foreign_keys() {
        let declared = SchemaDeclaration::new()
            .table(person(vec![ColumnDefinition::new("id", ColumnType::Serial).primary_key()]))
            .table(
                TableDefinition::new("address")
                    .column(ColumnDefinition::new("person_id", ColumnType::Integer))
                    .foreign_key(ForeignKeyDefinition::new("address_person_fk", "person_id", "person", "id"))
                    .index(IndexDefinition::new("address_person_idx", &["person_id"])),
            );
        let old = declared.to_state().unwrap();

        let desired = SchemaDeclaration::new().table(person(vec![
            ColumnDefinition::new("id", ColumnType::Serial).primary_key()
        ]));
        let ops = DiffEngine::new().compute_operations(&desired, &old).unwrap();

        assert!(matches!(&ops[0], Operation::DropForeignKey { .. }));
        assert!(matches!(&ops[1], Operation::DropIndex { .. }));
        assert!(matches!(&ops[2], Operation::DropTable { definition: Some(_), .. }));
        assert_eq!(replay(&old, &ops), desired.to_state().unwrap());

        // every drop reverses cleanly
        let mut state = replay(&old, &ops);
        for op in ops.iter().rev() {
            op.inverse().unwrap().state_forwards(&mut state).unwrap();
        }
        assert_eq!(state, old);

        // and creating from nothing puts the table before its foreign key
        let ops = DiffEngine::new().compute_operations(&declared, &SchemaState::new()).unwrap();
        let create = ops
            .iter()
            .position(|op| matches!(op, Operation::CreateTable { table } if table.name == "person"))
            .unwrap();
        let add_fk = ops
            .iter()
            .position(|op| matches!(op, Operation::AddForeignKey { .. }))
            .unwrap();
        assert!(create < add_fk);
        assert_eq!(replay(&SchemaState::new(), &ops), old);
    }

    #[test]
    fn test_propose_node_names_and_dependencies() {
        let engine = DiffEngine::new();
        let mut graph = MigrationGraph::new();

        let people = SchemaDeclaration::new().table(person(vec![
            ColumnDefinition::new("id", ColumnType::Serial).primary_key(),
        ]));
        let first = engine.propose_node(&graph, "people", &people).unwrap().unwrap();
        assert_eq!(first.id().to_string(), "people.0001_initial");
        graph.integrate(first).unwrap();

        assert!(engine.propose_node(&graph, "people", &people).unwrap().is_none());

        let blog = SchemaDeclaration::new().table(
            TableDefinition::new("post")
                .column(ColumnDefinition::new("author_id", ColumnType::Integer))
                .foreign_key(ForeignKeyDefinition::new("post_author_fk", "author_id", "person", "id")),
        );
        let post = engine.propose_node(&graph, "blog", &blog).unwrap().unwrap();
        assert_eq!(post.name, "0001_initial");
        assert_eq!(post.dependencies, vec![NodeId::new("people", "0001_initial")]);
        graph.integrate(post).unwrap();

        let people = SchemaDeclaration::new().table(person(vec![
            ColumnDefinition::new("id", ColumnType::Serial).primary_key(),
            ColumnDefinition::new("age", ColumnType::Integer).nullable(),
        ]));
        let second = engine.propose_node(&graph, "people", &people).unwrap().unwrap();
        assert_eq!(second.name, "0002_person_age");
        assert_eq!(second.dependencies, vec![NodeId::new("people", "0001_initial")]);

        // blog may not drop or redeclare a table owned by people
        let hijack = SchemaDeclaration::new().table(person(vec![name_column()]));
        assert!(matches!(
            engine.propose_node(&graph, "blog", &hijack),
            Err(MigrationError::InvalidDeclaration(_))
        ));
    }

    #[test]
    fn test_merge_node_depends_on_all_leaves() {
        let mut graph = MigrationGraph::new();
        graph
            .integrate_all(vec![
                MigrationNode::new("people", "0001_initial"),
                MigrationNode::new("people", "0002_a").add_dependency(NodeId::new("people", "0001_initial")),
                MigrationNode::new("people", "0002_b").add_dependency(NodeId::new("people", "0001_initial")),
            ])
            .unwrap();

        let merge = merge_node(&graph, "people").unwrap().unwrap();
        assert_eq!(merge.name, "0003_merge");
        assert_eq!(merge.dependencies.len(), 2);
        graph.integrate(merge).unwrap();

        assert!(graph.check_consistency().is_ok());
        assert!(merge_node(&graph, "people").unwrap().is_none());
    }
}
