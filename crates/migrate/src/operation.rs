//! Schema operations
//!
//! Each operation knows its inverse and how it changes a `SchemaState`.
//! Drops carry the definition they remove so they can be reversed; a drop
//! without a definition, or raw SQL without reverse SQL, is not reversible.

use serde::{Deserialize, Serialize};

use crate::error::{MigrationError, MigrationResult};
use crate::schema::{
    ColumnDefinition, ForeignKeyDefinition, IndexDefinition, SchemaState, TableDefinition,
};

/// An atomic unit of schema change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    CreateTable {
        table: TableDefinition,
    },
    DropTable {
        table: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        definition: Option<TableDefinition>,
    },
    AddColumn {
        table: String,
        column: ColumnDefinition,
    },
    DropColumn {
        table: String,
        column: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        definition: Option<ColumnDefinition>,
    },
    RenameColumn {
        table: String,
        from: String,
        to: String,
        /// The column carries a unique constraint, renamed along with it
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        unique: bool,
    },
    AlterColumn {
        table: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ColumnDefinition>,
        to: ColumnDefinition,
    },
    AddIndex {
        table: String,
        index: IndexDefinition,
    },
    DropIndex {
        table: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        definition: Option<IndexDefinition>,
    },
    AddForeignKey {
        table: String,
        foreign_key: ForeignKeyDefinition,
    },
    DropForeignKey {
        table: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        definition: Option<ForeignKeyDefinition>,
    },
    /// Arbitrary SQL, typically a data transformation
    RunSql {
        sql: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reverse_sql: Option<String>,
    },
}

impl Operation {
    /// Table the operation changes, if any
    pub fn table(&self) -> Option<&str> {
        match self {
            Operation::CreateTable { table } => Some(&table.name),
            Operation::DropTable { table, .. }
            | Operation::AddColumn { table, .. }
            | Operation::DropColumn { table, .. }
            | Operation::RenameColumn { table, .. }
            | Operation::AlterColumn { table, .. }
            | Operation::AddIndex { table, .. }
            | Operation::DropIndex { table, .. }
            | Operation::AddForeignKey { table, .. }
            | Operation::DropForeignKey { table, .. } => Some(table),
            Operation::RunSql { .. } => None,
        }
    }

    /// Other tables this operation needs to exist
    pub fn referenced_tables(&self) -> Vec<&str> {
        match self {
            Operation::CreateTable { table } => table
                .foreign_keys
                .iter()
                .map(|fk| fk.references_table.as_str())
                .filter(|referenced| *referenced != table.name)
                .collect(),
            Operation::AddForeignKey { table, foreign_key } if foreign_key.references_table != *table => {
                vec![foreign_key.references_table.as_str()]
            }
            _ => Vec::new(),
        }
    }

    /// The operation undoing this one, or `None` when it is not reversible
    pub fn inverse(&self) -> Option<Operation> {
        let inverse = match self {
            Operation::CreateTable { table } => Operation::DropTable {
                table: table.name.clone(),
                definition: Some(table.clone()),
            },
            Operation::DropTable { definition, .. } => Operation::CreateTable {
                table: definition.clone()?,
            },
            Operation::AddColumn { table, column } => Operation::DropColumn {
                table: table.clone(),
                column: column.name.clone(),
                definition: Some(column.clone()),
            },
            Operation::DropColumn {
                table, definition, ..
            } => Operation::AddColumn {
                table: table.clone(),
                column: definition.clone()?,
            },
            Operation::RenameColumn { table, from, to, unique } => Operation::RenameColumn {
                table: table.clone(),
                from: to.clone(),
                to: from.clone(),
                unique: *unique,
            },
            Operation::AlterColumn { table, from, to } => Operation::AlterColumn {
                table: table.clone(),
                from: Some(to.clone()),
                to: from.clone()?,
            },
            Operation::AddIndex { table, index } => Operation::DropIndex {
                table: table.clone(),
                name: index.name.clone(),
                definition: Some(index.clone()),
            },
            Operation::DropIndex {
                table, definition, ..
            } => Operation::AddIndex {
                table: table.clone(),
                index: definition.clone()?,
            },
            Operation::AddForeignKey { table, foreign_key } => Operation::DropForeignKey {
                table: table.clone(),
                name: foreign_key.name.clone(),
                definition: Some(foreign_key.clone()),
            },
            Operation::DropForeignKey {
                table, definition, ..
            } => Operation::AddForeignKey {
                table: table.clone(),
                foreign_key: definition.clone()?,
            },
            Operation::RunSql { sql, reverse_sql } => Operation::RunSql {
                sql: reverse_sql.clone()?,
                reverse_sql: Some(sql.clone()),
            },
        };
        Some(inverse)
    }

    pub fn is_reversible(&self) -> bool {
        match self {
            Operation::DropTable { definition, .. } => definition.is_some(),
            Operation::DropColumn { definition, .. } => definition.is_some(),
            Operation::AlterColumn { from, .. } => from.is_some(),
            Operation::DropIndex { definition, .. } => definition.is_some(),
            Operation::DropForeignKey { definition, .. } => definition.is_some(),
            Operation::RunSql { reverse_sql, .. } => reverse_sql.is_some(),
            _ => true,
        }
    }

    /// Human-readable one-line description
    pub fn describe(&self) -> String {
        match self {
            Operation::CreateTable { table } => format!("Create table {}", table.name),
            Operation::DropTable { table, .. } => format!("Drop table {}", table),
            Operation::AddColumn { table, column } => format!("Add column {} to {}", column.name, table),
            Operation::DropColumn { table, column, .. } => format!("Remove column {} from {}", column, table),
            Operation::RenameColumn { table, from, to, .. } => {
                format!("Rename column {}.{} to {}", table, from, to)
            }
            Operation::AlterColumn { table, to, .. } => format!("Alter column {}.{}", table, to.name),
            Operation::AddIndex { table, index } => format!(
                "Create {}index {} on {} ({})",
                if index.unique { "unique " } else { "" },
                index.name,
                table,
                index.columns.join(", ")
            ),
            Operation::DropIndex { table, name, .. } => format!("Drop index {} on {}", name, table),
            Operation::AddForeignKey { table, foreign_key } => format!(
                "Add foreign key {} on {}.{} referencing {}.{}",
                foreign_key.name,
                table,
                foreign_key.column,
                foreign_key.references_table,
                foreign_key.references_column
            ),
            Operation::DropForeignKey { table, name, .. } => {
                format!("Drop foreign key {} on {}", name, table)
            }
            Operation::RunSql { .. } => "Run SQL".to_string(),
        }
    }

    /// Fragment used when naming a generated node, `None` for raw SQL
    pub fn name_fragment(&self) -> Option<String> {
        let fragment = match self {
            Operation::CreateTable { table } => table.name.clone(),
            Operation::DropTable { table, .. } => format!("delete_{}", table),
            Operation::AddColumn { table, column } => format!("{}_{}", table, column.name),
            Operation::DropColumn { table, column, .. } => format!("remove_{}_{}", table, column),
            Operation::RenameColumn { table, from, to, .. } => format!("rename_{}_{}_{}", table, from, to),
            Operation::AlterColumn { table, to, .. } => format!("alter_{}_{}", table, to.name),
            Operation::AddIndex { index, .. } => index.name.clone(),
            Operation::DropIndex { name, .. } => format!("remove_{}", name),
            Operation::AddForeignKey { foreign_key, .. } => foreign_key.name.clone(),
            Operation::DropForeignKey { name, .. } => format!("remove_{}", name),
            Operation::RunSql { .. } => return None,
        };
        Some(fragment.to_lowercase())
    }

    /// Apply this operation to a structural schema state
    pub fn state_forwards(&self, state: &mut SchemaState) -> MigrationResult<()> {
        let fail = |reason: String| Err(MigrationError::invalid_operation(self.describe(), reason));

        match self {
            Operation::CreateTable { table } => {
                if state.has_table(&table.name) {
                    return fail(format!("table '{}' already exists", table.name));
                }
                let created = table.to_state().map_err(|e| {
                    MigrationError::invalid_operation(self.describe(), e.to_string())
                })?;
                for fk in created.foreign_keys.values() {
                    let referenced = if fk.references_table == table.name {
                        Some(&created)
                    } else {
                        state.table(&fk.references_table)
                    };
                    match referenced {
                        Some(t) if t.columns.contains_key(&fk.references_column) => {}
                        _ => {
                            return fail(format!(
                                "foreign key '{}' references missing column '{}.{}'",
                                fk.name, fk.references_table, fk.references_column
                            ))
                        }
                    }
                }
                for index in created.indexes.keys() {
                    if let Some(owner) = state.index_owner(index) {
                        return fail(format!("index '{}' already exists on '{}'", index, owner));
                    }
                }
                state.tables.insert(table.name.clone(), created);
            }
            Operation::DropTable { table, .. } => {
                if !state.has_table(table) {
                    return fail(format!("table '{}' does not exist", table));
                }
                if let Some((referencing, fk)) = state.references_to(table).first() {
                    return fail(format!(
                        "table is still referenced by foreign key '{}' on '{}'",
                        fk.name, referencing
                    ));
                }
                state.tables.remove(table);
            }
            Operation::AddColumn { table, column } => {
                let Some(target) = state.table_mut(table) else {
                    return fail(format!("table '{}' does not exist", table));
                };
                if target.columns.contains_key(&column.name) {
                    return fail(format!("column '{}.{}' already exists", table, column.name));
                }
                target.columns.insert(column.name.clone(), column.clone());
            }
            Operation::DropColumn { table, column, .. } => {
                let referenced_elsewhere = state
                    .references_to(table)
                    .iter()
                    .find(|(_, fk)| fk.references_column == *column)
                    .map(|(t, fk)| format!("foreign key '{}' on '{}'", fk.name, t));
                let Some(target) = state.table_mut(table) else {
                    return fail(format!("table '{}' does not exist", table));
                };
                if !target.columns.contains_key(column) {
                    return fail(format!("column '{}.{}' does not exist", table, column));
                }
                if let Some(index) = target.indexes.values().find(|i| i.columns.contains(column)) {
                    return fail(format!("column is still used by index '{}'", index.name));
                }
                if let Some(fk) = target
                    .foreign_keys
                    .values()
                    .find(|fk| fk.column == *column || (fk.references_table == *table && fk.references_column == *column))
                {
                    return fail(format!("column is still used by foreign key '{}'", fk.name));
                }
                if let Some(fk) = referenced_elsewhere {
                    return fail(format!("column is still referenced by {}", fk));
                }
                target.columns.remove(column);
            }
            Operation::RenameColumn { table, from, to, unique } => {
                let Some(target) = state.table_mut(table) else {
                    return fail(format!("table '{}' does not exist", table));
                };
                if target.columns.contains_key(to) {
                    return fail(format!("column '{}.{}' already exists", table, to));
                }
                let Some(column) = target.columns.get(from) else {
                    return fail(format!("column '{}.{}' does not exist", table, from));
                };
                if column.unique != *unique {
                    return fail(format!("unique flag {} does not match column '{}.{}'", unique, table, from));
                }
                let renamed = column.renamed(to.clone());
                target.columns.remove(from);
                target.columns.insert(to.clone(), renamed);
                for index in target.indexes.values_mut() {
                    for name in index.columns.iter_mut() {
                        if *name == *from {
                            *name = to.clone();
                        }
                    }
                }
                for fk in target.foreign_keys.values_mut() {
                    if fk.column == *from {
                        fk.column = to.clone();
                    }
                }
                for other in state.tables.values_mut() {
                    for fk in other.foreign_keys.values_mut() {
                        if fk.references_table == *table && fk.references_column == *from {
                            fk.references_column = to.clone();
                        }
                    }
                }
            }
            Operation::AlterColumn { table, to, .. } => {
                let Some(target) = state.table_mut(table) else {
                    return fail(format!("table '{}' does not exist", table));
                };
                match target.columns.get_mut(&to.name) {
                    Some(column) => *column = to.clone(),
                    None => return fail(format!("column '{}.{}' does not exist", table, to.name)),
                }
            }
            Operation::AddIndex { table, index } => {
                if let Some(owner) = state.index_owner(&index.name) {
                    return fail(format!("index '{}' already exists on '{}'", index.name, owner));
                }
                let Some(target) = state.table_mut(table) else {
                    return fail(format!("table '{}' does not exist", table));
                };
                if index.columns.is_empty() {
                    return fail("index has no columns".to_string());
                }
                if let Some(missing) = index.columns.iter().find(|c| !target.columns.contains_key(*c)) {
                    return fail(format!("column '{}.{}' does not exist", table, missing));
                }
                target.indexes.insert(index.name.clone(), index.clone());
            }
            Operation::DropIndex { table, name, .. } => {
                let Some(target) = state.table_mut(table) else {
                    return fail(format!("table '{}' does not exist", table));
                };
                if target.indexes.remove(name).is_none() {
                    return fail(format!("index '{}' does not exist on '{}'", name, table));
                }
            }
            Operation::AddForeignKey { table, foreign_key } => {
                let referenced_ok = state
                    .table(&foreign_key.references_table)
                    .map(|t| t.columns.contains_key(&foreign_key.references_column))
                    .unwrap_or(false);
                if !referenced_ok {
                    return fail(format!(
                        "referenced column '{}.{}' does not exist",
                        foreign_key.references_table, foreign_key.references_column
                    ));
                }
                let Some(target) = state.table_mut(table) else {
                    return fail(format!("table '{}' does not exist", table));
                };
                if !target.columns.contains_key(&foreign_key.column) {
                    return fail(format!("column '{}.{}' does not exist", table, foreign_key.column));
                }
                if target.foreign_keys.contains_key(&foreign_key.name) {
                    return fail(format!("foreign key '{}' already exists on '{}'", foreign_key.name, table));
                }
                target.foreign_keys.insert(foreign_key.name.clone(), foreign_key.clone());
            }
            Operation::DropForeignKey { table, name, .. } => {
                let Some(target) = state.table_mut(table) else {
                    return fail(format!("table '{}' does not exist", table));
                };
                if target.foreign_keys.remove(name).is_none() {
                    return fail(format!("foreign key '{}' does not exist on '{}'", name, table));
                }
            }
            Operation::RunSql { .. } => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnType, SchemaDeclaration};

    fn person_state() -> SchemaState {
        SchemaDeclaration::new()
            .table(
                TableDefinition::new("person")
                    .column(ColumnDefinition::new("id", ColumnType::Serial).primary_key())
                    .column(ColumnDefinition::new("name", ColumnType::Varchar(20)))
                    .column(ColumnDefinition::new("email", ColumnType::Varchar(254)))
                    .index(IndexDefinition::new("person_name_idx", &["name"])),
            )
            .table(
                TableDefinition::new("address")
                    .column(ColumnDefinition::new("id", ColumnType::Serial).primary_key())
                    .column(ColumnDefinition::new("person_id", ColumnType::Integer))
                    .foreign_key(ForeignKeyDefinition::new("address_person_fk", "person_id", "person", "id")),
            )
            .to_state()
            .unwrap()
    }

    fn reversible_operations() -> Vec<Operation> {
        let state = person_state();
        vec![
            Operation::CreateTable {
                table: TableDefinition::new("tag").column(ColumnDefinition::new("label", ColumnType::Text)),
            },
            Operation::DropTable {
                table: "address".to_string(),
                definition: Some(TableDefinition {
                    foreign_keys: Vec::new(),
                    ..state.table("address").unwrap().to_definition()
                }),
            },
            Operation::AddColumn {
                table: "person".to_string(),
                column: ColumnDefinition::new("age", ColumnType::Integer).nullable(),
            },
            Operation::DropColumn {
                table: "person".to_string(),
                column: "email".to_string(),
                definition: state.table("person").unwrap().column("email").cloned(),
            },
            Operation::RenameColumn {
                table: "person".to_string(),
                from: "name".to_string(),
                to: "person_name".to_string(),
                unique: false,
            },
            Operation::AlterColumn {
                table: "person".to_string(),
                from: state.table("person").unwrap().column("email").cloned(),
                to: ColumnDefinition::new("email", ColumnType::Text).nullable().unique(),
            },
            Operation::AddIndex {
                table: "person".to_string(),
                index: IndexDefinition::new("person_email_idx", &["email"]).unique(),
            },
            Operation::DropIndex {
                table: "person".to_string(),
                name: "person_name_idx".to_string(),
                definition: state.table("person").unwrap().indexes.get("person_name_idx").cloned(),
            },
            Operation::AddForeignKey {
                table: "person".to_string(),
                foreign_key: ForeignKeyDefinition::new("person_self_fk", "id", "person", "id"),
            },
            Operation::DropForeignKey {
                table: "address".to_string(),
                name: "address_person_fk".to_string(),
                definition: state.table("address").unwrap().foreign_keys.get("address_person_fk").cloned(),
            },
            Operation::RunSql {
                sql: "UPDATE person SET name = upper(name)".to_string(),
                reverse_sql: Some("SELECT 1".to_string()),
            },
        ]
    }

    #[test]
    fn test_operation_then_inverse_restores_state() {
        for op in reversible_operations() {
            let mut state = person_state();

            if let Operation::DropTable { .. } = op {
                // the table must be bare before it can be dropped
                Operation::DropForeignKey {
                    table: "address".to_string(),
                    name: "address_person_fk".to_string(),
                    definition: None,
                }
                .state_forwards(&mut state)
                .unwrap();
            }
            let before = state.clone();

            op.state_forwards(&mut state).unwrap();
            if op.table().is_some() {
                assert_ne!(state, before, "{} should change the schema", op.describe());
            }

            let inverse = op.inverse().expect("reversible");
            inverse.state_forwards(&mut state).unwrap();
            assert_eq!(state, before, "inverse of '{}' did not restore the schema", op.describe());
        }
    }

    #[test]
    fn test_drops_without_definition_are_not_reversible() {
        let op = Operation::DropColumn {
            table: "person".to_string(),
            column: "email".to_string(),
            definition: None,
        };
        assert!(!op.is_reversible());
        assert!(op.inverse().is_none());

        let sql = Operation::RunSql {
            sql: "DELETE FROM person".to_string(),
            reverse_sql: None,
        };
        assert!(!sql.is_reversible());
        assert!(sql.inverse().is_none());
    }

    #[test]
    fn test_rename_rewrites_index_and_foreign_keys() {
        let mut state = person_state();
        Operation::RenameColumn {
            table: "person".to_string(),
            from: "id".to_string(),
            to: "person_id".to_string(),
            unique: false,
        }
        .state_forwards(&mut state)
        .unwrap();

        let fk = &state.table("address").unwrap().foreign_keys["address_person_fk"];
        assert_eq!(fk.references_column, "person_id");

        Operation::RenameColumn {
            table: "person".to_string(),
            from: "name".to_string(),
            to: "full_name".to_string(),
            unique: false,
        }
        .state_forwards(&mut state)
        .unwrap();
        let index = &state.table("person").unwrap().indexes["person_name_idx"];
        assert_eq!(index.columns, vec!["full_name".to_string()]);
    }

    #[test]
    fn test_preconditions_are_enforced() {
        let mut state = person_state();

        let err = Operation::DropTable {
            table: "person".to_string(),
            definition: None,
        }
        .state_forwards(&mut state)
        .unwrap_err();
        assert!(err.to_string().contains("address_person_fk"));

        let err = Operation::DropColumn {
            table: "person".to_string(),
            column: "name".to_string(),
            definition: None,
        }
        .state_forwards(&mut state)
        .unwrap_err();
        assert!(err.to_string().contains("person_name_idx"));

        let err = Operation::AddColumn {
            table: "ghost".to_string(),
            column: ColumnDefinition::new("x", ColumnType::Integer),
        }
        .state_forwards(&mut state)
        .unwrap_err();
        assert!(matches!(err, MigrationError::InvalidOperation { .. }));
    }

    #[test]
    fn test_operation_serialization_is_tagged() {
        let op = Operation::RenameColumn {
            table: "person".to_string(),
            from: "name".to_string(),
            to: "person_name".to_string(),
            unique: false,
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["kind"], "rename_column");
        assert_eq!(op.name_fragment().as_deref(), Some("rename_person_name_person_name"));
    }
}
