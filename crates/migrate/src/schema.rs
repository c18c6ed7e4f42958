//! Schema declarations and structural schema state
//!
//! `SchemaDeclaration` is the desired state handed to the diff engine as plain
//! data. `SchemaState` is the structural schema obtained by replaying
//! operations; it keys everything by name so equality ignores ordering.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{MigrationError, MigrationResult};

/// Column data type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ColumnType {
    SmallInteger,
    Integer,
    BigInteger,
    Serial,
    BigSerial,
    Boolean,
    Real,
    Double,
    Decimal { precision: u8, scale: u8 },
    Varchar(u32),
    Text,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Uuid,
    Json,
    Jsonb,
    Binary,
    /// Backend-specific type passed through verbatim
    Custom(String),
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::SmallInteger => write!(f, "smallint"),
            ColumnType::Integer => write!(f, "int"),
            ColumnType::BigInteger => write!(f, "bigint"),
            ColumnType::Serial => write!(f, "serial"),
            ColumnType::BigSerial => write!(f, "bigserial"),
            ColumnType::Boolean => write!(f, "boolean"),
            ColumnType::Real => write!(f, "real"),
            ColumnType::Double => write!(f, "double"),
            ColumnType::Decimal { precision, scale } => write!(f, "decimal({},{})", precision, scale),
            ColumnType::Varchar(length) => write!(f, "varchar({})", length),
            ColumnType::Text => write!(f, "text"),
            ColumnType::Date => write!(f, "date"),
            ColumnType::Time => write!(f, "time"),
            ColumnType::Timestamp => write!(f, "timestamp"),
            ColumnType::TimestampTz => write!(f, "timestamptz"),
            ColumnType::Uuid => write!(f, "uuid"),
            ColumnType::Json => write!(f, "json"),
            ColumnType::Jsonb => write!(f, "jsonb"),
            ColumnType::Binary => write!(f, "binary"),
            ColumnType::Custom(sql) => write!(f, "{}", sql),
        }
    }
}

impl FromStr for ColumnType {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err(MigrationError::InvalidDeclaration(
                "column type cannot be empty".to_string(),
            ));
        }

        let normalized = raw.to_lowercase().replace(' ', "");
        let parsed = match normalized.as_str() {
            "smallint" | "int2" => ColumnType::SmallInteger,
            "int" | "integer" | "int4" => ColumnType::Integer,
            "bigint" | "int8" => ColumnType::BigInteger,
            "serial" => ColumnType::Serial,
            "bigserial" => ColumnType::BigSerial,
            "bool" | "boolean" => ColumnType::Boolean,
            "real" | "float" | "float4" => ColumnType::Real,
            "double" | "doubleprecision" | "float8" => ColumnType::Double,
            "text" => ColumnType::Text,
            "date" => ColumnType::Date,
            "time" => ColumnType::Time,
            "timestamp" => ColumnType::Timestamp,
            "timestamptz" => ColumnType::TimestampTz,
            "uuid" => ColumnType::Uuid,
            "json" => ColumnType::Json,
            "jsonb" => ColumnType::Jsonb,
            "binary" | "bytea" | "blob" => ColumnType::Binary,
            other => {
                if let Some(args) = parenthesized(other, &["varchar", "charactervarying"]) {
                    let length = args.parse::<u32>().map_err(|_| {
                        MigrationError::InvalidDeclaration(format!("invalid varchar length in '{}'", raw))
                    })?;
                    ColumnType::Varchar(length)
                } else if let Some(args) = parenthesized(other, &["decimal", "numeric"]) {
                    let (precision, scale) = args.split_once(',').unwrap_or((args, "0"));
                    match (precision.parse::<u8>(), scale.parse::<u8>()) {
                        (Ok(precision), Ok(scale)) => ColumnType::Decimal { precision, scale },
                        _ => {
                            return Err(MigrationError::InvalidDeclaration(format!(
                                "invalid decimal precision in '{}'",
                                raw
                            )))
                        }
                    }
                } else {
                    ColumnType::Custom(raw.to_string())
                }
            }
        };

        Ok(parsed)
    }
}

fn parenthesized<'a>(value: &'a str, prefixes: &[&str]) -> Option<&'a str> {
    prefixes.iter().find_map(|prefix| {
        value
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('('))
            .and_then(|rest| rest.strip_suffix(')'))
    })
}

impl TryFrom<String> for ColumnType {
    type Error = MigrationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ColumnType> for String {
    fn from(value: ColumnType) -> Self {
        value.to_string()
    }
}

/// Column definition as declared or as recorded in a schema snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub primary_key: bool,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
            default: None,
            unique: false,
            primary_key: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Set the default as a raw SQL expression
    pub fn default_value(mut self, expression: impl Into<String>) -> Self {
        self.default = Some(expression.into());
        self
    }

    /// Same type and constraints, ignoring the name
    pub fn same_shape(&self, other: &ColumnDefinition) -> bool {
        self.column_type == other.column_type
            && self.nullable == other.nullable
            && self.default == other.default
            && self.unique == other.unique
            && self.primary_key == other.primary_key
    }

    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }
}

/// Index over one or more columns of a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexDefinition {
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Action taken on the referencing row when the referenced row is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferentialAction {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl ReferentialAction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
        }
    }
}

/// Single-column foreign key constraint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyDefinition {
    pub name: String,
    pub column: String,
    pub references_table: String,
    pub references_column: String,
    #[serde(default)]
    pub on_delete: ReferentialAction,
}

impl ForeignKeyDefinition {
    pub fn new(
        name: impl Into<String>,
        column: impl Into<String>,
        references_table: impl Into<String>,
        references_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            column: column.into(),
            references_table: references_table.into(),
            references_column: references_column.into(),
            on_delete: ReferentialAction::NoAction,
        }
    }

    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        self.on_delete = action;
        self
    }
}

/// Declared table: columns in authored order plus indexes and foreign keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<IndexDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign_keys: Vec<ForeignKeyDefinition>,
}

impl TableDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnDefinition) -> Self {
        self.columns.push(column);
        self
    }

    pub fn index(mut self, index: IndexDefinition) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn foreign_key(mut self, foreign_key: ForeignKeyDefinition) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }

    /// Build the state of this table, rejecting duplicates and dangling column references
    pub fn to_state(&self) -> MigrationResult<TableState> {
        if self.name.trim().is_empty() {
            return Err(MigrationError::InvalidDeclaration("table name cannot be empty".to_string()));
        }
        if self.columns.is_empty() {
            return Err(MigrationError::InvalidDeclaration(format!(
                "table '{}' declares no columns",
                self.name
            )));
        }

        let mut table = TableState::new(&self.name);
        for column in &self.columns {
            if column.name.trim().is_empty() {
                return Err(MigrationError::InvalidDeclaration(format!(
                    "table '{}' has a column without a name",
                    self.name
                )));
            }
            if table.columns.insert(column.name.clone(), column.clone()).is_some() {
                return Err(MigrationError::InvalidDeclaration(format!(
                    "duplicate column '{}.{}'",
                    self.name, column.name
                )));
            }
        }

        for index in &self.indexes {
            if index.columns.is_empty() {
                return Err(MigrationError::InvalidDeclaration(format!(
                    "index '{}' on '{}' has no columns",
                    index.name, self.name
                )));
            }
            if let Some(missing) = index.columns.iter().find(|c| !table.columns.contains_key(*c)) {
                return Err(MigrationError::InvalidDeclaration(format!(
                    "index '{}' references unknown column '{}.{}'",
                    index.name, self.name, missing
                )));
            }
            if table.indexes.insert(index.name.clone(), index.clone()).is_some() {
                return Err(MigrationError::InvalidDeclaration(format!(
                    "duplicate index '{}' on '{}'",
                    index.name, self.name
                )));
            }
        }

        for foreign_key in &self.foreign_keys {
            if !table.columns.contains_key(&foreign_key.column) {
                return Err(MigrationError::InvalidDeclaration(format!(
                    "foreign key '{}' references unknown column '{}.{}'",
                    foreign_key.name, self.name, foreign_key.column
                )));
            }
            if table
                .foreign_keys
                .insert(foreign_key.name.clone(), foreign_key.clone())
                .is_some()
            {
                return Err(MigrationError::InvalidDeclaration(format!(
                    "duplicate foreign key '{}' on '{}'",
                    foreign_key.name, self.name
                )));
            }
        }

        Ok(table)
    }
}

/// Desired schema, as produced by the model declaration layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDeclaration {
    #[serde(default)]
    pub tables: Vec<TableDefinition>,
}

impl SchemaDeclaration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, table: TableDefinition) -> Self {
        self.tables.push(table);
        self
    }

    pub fn find_table(&self, name: &str) -> Option<&TableDefinition> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn from_yaml_str(source: &str) -> MigrationResult<Self> {
        Ok(serde_yaml::from_str(source)?)
    }

    pub fn from_json_str(source: &str) -> MigrationResult<Self> {
        Ok(serde_json::from_str(source)?)
    }

    /// Load a declaration file; `.json` is read as JSON, anything else as YAML
    pub fn from_path(path: &Path) -> MigrationResult<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_yaml_str(&content),
        }
    }

    /// Validated structural state of the declaration.
    ///
    /// Foreign keys must reference a table and column of the declaration or of
    /// `external`, the tables owned by other namespaces.
    pub fn to_state_with(&self, external: &SchemaState) -> MigrationResult<SchemaState> {
        let mut state = SchemaState::new();
        for table in &self.tables {
            if state.tables.insert(table.name.clone(), table.to_state()?).is_some() {
                return Err(MigrationError::InvalidDeclaration(format!(
                    "duplicate table '{}'",
                    table.name
                )));
            }
        }

        let mut index_names = BTreeSet::new();
        for table in state.tables.values() {
            for index in table.indexes.keys() {
                if !index_names.insert(index.clone()) {
                    return Err(MigrationError::InvalidDeclaration(format!(
                        "index name '{}' is used more than once",
                        index
                    )));
                }
            }

            for foreign_key in table.foreign_keys.values() {
                let referenced = state
                    .tables
                    .get(&foreign_key.references_table)
                    .or_else(|| external.tables.get(&foreign_key.references_table))
                    .ok_or_else(|| {
                        MigrationError::InvalidDeclaration(format!(
                            "foreign key '{}' references unknown table '{}'",
                            foreign_key.name, foreign_key.references_table
                        ))
                    })?;
                if !referenced.columns.contains_key(&foreign_key.references_column) {
                    return Err(MigrationError::InvalidDeclaration(format!(
                        "foreign key '{}' references unknown column '{}.{}'",
                        foreign_key.name, foreign_key.references_table, foreign_key.references_column
                    )));
                }
            }
        }

        Ok(state)
    }

    pub fn to_state(&self) -> MigrationResult<SchemaState> {
        self.to_state_with(&SchemaState::new())
    }
}

/// Structural state of one table
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableState {
    pub name: String,
    pub columns: BTreeMap<String, ColumnDefinition>,
    pub indexes: BTreeMap<String, IndexDefinition>,
    pub foreign_keys: BTreeMap<String, ForeignKeyDefinition>,
}

impl TableState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.get(name)
    }

    /// Definition of this table, columns ordered by name
    pub fn to_definition(&self) -> TableDefinition {
        TableDefinition {
            name: self.name.clone(),
            columns: self.columns.values().cloned().collect(),
            indexes: self.indexes.values().cloned().collect(),
            foreign_keys: self.foreign_keys.values().cloned().collect(),
        }
    }
}

/// Cumulative structural schema
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SchemaState {
    pub tables: BTreeMap<String, TableState>,
}

impl SchemaState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self, name: &str) -> Option<&TableState> {
        self.tables.get(name)
    }

    pub fn table_mut(&mut self, name: &str) -> Option<&mut TableState> {
        self.tables.get_mut(name)
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Foreign keys on other tables that point at `table`
    pub fn references_to(&self, table: &str) -> Vec<(&str, &ForeignKeyDefinition)> {
        self.tables
            .values()
            .filter(|t| t.name != table)
            .flat_map(|t| {
                t.foreign_keys
                    .values()
                    .filter(move |fk| fk.references_table == table)
                    .map(move |fk| (t.name.as_str(), fk))
            })
            .collect()
    }

    /// Table owning an index of that name, if any
    pub fn index_owner(&self, index: &str) -> Option<&str> {
        self.tables
            .values()
            .find(|t| t.indexes.contains_key(index))
            .map(|t| t.name.as_str())
    }

    /// Split into (tables in `names`, every other table)
    pub fn partition(&self, names: &BTreeSet<String>) -> (SchemaState, SchemaState) {
        let (inside, outside): (BTreeMap<_, _>, BTreeMap<_, _>) = self
            .tables
            .iter()
            .map(|(name, table)| (name.clone(), table.clone()))
            .partition(|(name, _)| names.contains(name));
        (SchemaState { tables: inside }, SchemaState { tables: outside })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_type_parsing() {
        assert_eq!("varchar(20)".parse::<ColumnType>().unwrap(), ColumnType::Varchar(20));
        assert_eq!("INT".parse::<ColumnType>().unwrap(), ColumnType::Integer);
        assert_eq!(
            "numeric(10, 2)".parse::<ColumnType>().unwrap(),
            ColumnType::Decimal { precision: 10, scale: 2 }
        );
        assert_eq!(
            "tsvector".parse::<ColumnType>().unwrap(),
            ColumnType::Custom("tsvector".to_string())
        );
        assert!("varchar(x)".parse::<ColumnType>().is_err());
    }

    #[test]
    fn test_declaration_from_yaml() {
        let yaml = r#"
tables:
  - name: person
    columns:
      - { name: name, type: varchar(20) }
      - { name: email, type: varchar(254), unique: true }
      - { name: age, type: int, nullable: true }
    indexes:
      - { name: person_email_idx, columns: [email] }
"#;
        let declaration = SchemaDeclaration::from_yaml_str(yaml).unwrap();
        let person = declaration.find_table("person").unwrap();

        assert_eq!(person.columns.len(), 3);
        assert_eq!(person.columns[1].column_type, ColumnType::Varchar(254));
        assert!(person.columns[1].unique);
        assert!(person.columns[2].nullable);
        assert_eq!(person.indexes[0].columns, vec!["email".to_string()]);
    }

    #[test]
    fn test_declaration_rejects_dangling_references() {
        let declaration = SchemaDeclaration::new().table(
            TableDefinition::new("post")
                .column(ColumnDefinition::new("author_id", ColumnType::Integer))
                .foreign_key(ForeignKeyDefinition::new("post_author_fk", "author_id", "author", "id")),
        );

        let err = declaration.to_state().unwrap_err();
        assert!(matches!(err, MigrationError::InvalidDeclaration(msg) if msg.contains("unknown table 'author'")));
    }

    #[test]
    fn test_declaration_rejects_duplicate_columns() {
        let declaration = SchemaDeclaration::new().table(
            TableDefinition::new("person")
                .column(ColumnDefinition::new("name", ColumnType::Text))
                .column(ColumnDefinition::new("name", ColumnType::Text)),
        );

        assert!(matches!(
            declaration.to_state(),
            Err(MigrationError::InvalidDeclaration(_))
        ));
    }

    #[test]
    fn test_state_equality_ignores_column_order() {
        let a = SchemaDeclaration::new().table(
            TableDefinition::new("t")
                .column(ColumnDefinition::new("a", ColumnType::Text))
                .column(ColumnDefinition::new("b", ColumnType::Integer)),
        );
        let b = SchemaDeclaration::new().table(
            TableDefinition::new("t")
                .column(ColumnDefinition::new("b", ColumnType::Integer))
                .column(ColumnDefinition::new("a", ColumnType::Text)),
        );

        assert_eq!(a.to_state().unwrap(), b.to_state().unwrap());
    }
}
