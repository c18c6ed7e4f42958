//! DDL rendering per SQL dialect

use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::fmt;

use crate::error::{MigrationError, MigrationResult};
use crate::operation::Operation;
use crate::schema::{ColumnDefinition, ColumnType, ForeignKeyDefinition, IndexDefinition, TableDefinition};

/// SQL dialect of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlDialect {
    PostgreSQL,
    MySQL,
    SQLite,
}

impl fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SqlDialect::PostgreSQL => "PostgreSQL",
            SqlDialect::MySQL => "MySQL",
            SqlDialect::SQLite => "SQLite",
        };
        write!(f, "{}", name)
    }
}

impl SqlDialect {
    /// Dialect implied by a connection URL scheme
    pub fn from_url(url: &str) -> Option<Self> {
        let scheme = url.split_once("://").map(|(scheme, _)| scheme).unwrap_or(url);
        match scheme {
            "postgres" | "postgresql" => Some(SqlDialect::PostgreSQL),
            "mysql" | "mariadb" => Some(SqlDialect::MySQL),
            "sqlite" => Some(SqlDialect::SQLite),
            _ => None,
        }
    }

    /// Get the parameter placeholder style for this dialect
    pub fn parameter_placeholder(&self, index: usize) -> String {
        match self {
            SqlDialect::PostgreSQL => format!("${}", index + 1),
            SqlDialect::MySQL | SqlDialect::SQLite => "?".to_string(),
        }
    }

    /// Get the quote character for identifiers in this dialect
    pub fn identifier_quote(&self) -> char {
        match self {
            SqlDialect::PostgreSQL | SqlDialect::SQLite => '"',
            SqlDialect::MySQL => '`',
        }
    }

    pub fn quote_identifier(&self, identifier: &str) -> String {
        let quote = self.identifier_quote();
        let escaped = identifier.replace(quote, &format!("{}{}", quote, quote));
        format!("{}{}{}", quote, escaped, quote)
    }

    pub fn column_type(&self, column_type: &ColumnType) -> String {
        use SqlDialect::*;

        match (self, column_type) {
            (_, ColumnType::SmallInteger) => "SMALLINT".to_string(),
            (SQLite, ColumnType::Integer | ColumnType::BigInteger | ColumnType::Serial | ColumnType::BigSerial) => {
                "INTEGER".to_string()
            }
            (_, ColumnType::Integer) => "INTEGER".to_string(),
            (_, ColumnType::BigInteger) => "BIGINT".to_string(),
            (PostgreSQL, ColumnType::Serial) => "SERIAL".to_string(),
            (PostgreSQL, ColumnType::BigSerial) => "BIGSERIAL".to_string(),
            (MySQL, ColumnType::Serial) => "INT AUTO_INCREMENT".to_string(),
            (MySQL, ColumnType::BigSerial) => "BIGINT AUTO_INCREMENT".to_string(),
            (MySQL, ColumnType::Boolean) => "TINYINT(1)".to_string(),
            (_, ColumnType::Boolean) => "BOOLEAN".to_string(),
            (_, ColumnType::Real) => "REAL".to_string(),
            (PostgreSQL, ColumnType::Double) => "DOUBLE PRECISION".to_string(),
            (MySQL, ColumnType::Double) => "DOUBLE".to_string(),
            (SQLite, ColumnType::Double) => "REAL".to_string(),
            (MySQL, ColumnType::Decimal { precision, scale }) => format!("DECIMAL({},{})", precision, scale),
            (_, ColumnType::Decimal { precision, scale }) => format!("NUMERIC({},{})", precision, scale),
            (_, ColumnType::Varchar(length)) => format!("VARCHAR({})", length),
            (_, ColumnType::Text) => "TEXT".to_string(),
            (_, ColumnType::Date) => "DATE".to_string(),
            (_, ColumnType::Time) => "TIME".to_string(),
            (_, ColumnType::Timestamp) => "TIMESTAMP".to_string(),
            (PostgreSQL, ColumnType::TimestampTz) => "TIMESTAMPTZ".to_string(),
            (_, ColumnType::TimestampTz) => "TIMESTAMP".to_string(),
            (PostgreSQL, ColumnType::Uuid) => "UUID".to_string(),
            (MySQL, ColumnType::Uuid) => "CHAR(36)".to_string(),
            (SQLite, ColumnType::Uuid) => "TEXT".to_string(),
            (PostgreSQL, ColumnType::Json) => "JSON".to_string(),
            (PostgreSQL, ColumnType::Jsonb) => "JSONB".to_string(),
            (MySQL, ColumnType::Json | ColumnType::Jsonb) => "JSON".to_string(),
            (SQLite, ColumnType::Json | ColumnType::Jsonb) => "TEXT".to_string(),
            (PostgreSQL, ColumnType::Binary) => "BYTEA".to_string(),
            (_, ColumnType::Binary) => "BLOB".to_string(),
            (_, ColumnType::Custom(sql)) => sql.clone(),
        }
    }

    /// Column clause as used in CREATE TABLE and ADD COLUMN
    pub fn column_definition(&self, column: &ColumnDefinition) -> String {
        let mut sql = format!(
            "{} {}",
            self.quote_identifier(&column.name),
            self.column_type(&column.column_type)
        );

        if column.primary_key {
            sql.push_str(" PRIMARY KEY");
        } else if !column.nullable {
            sql.push_str(" NOT NULL");
        }

        if column.unique && !column.primary_key {
            sql.push_str(" UNIQUE");
        }

        if let Some(default) = &column.default {
            sql.push_str(&format!(" DEFAULT {}", default));
        }

        sql
    }

    /// Statements implementing one operation
    pub fn render(&self, operation: &Operation) -> MigrationResult<Vec<String>> {
        let statements = match operation {
            Operation::CreateTable { table } => self.create_table(table),
            Operation::DropTable { table, .. } => {
                vec![format!("DROP TABLE {}", self.quote_identifier(table))]
            }
            Operation::AddColumn { table, column } => vec![format!(
                "ALTER TABLE {} ADD COLUMN {}",
                self.quote_identifier(table),
                self.column_definition(column)
            )],
            Operation::DropColumn { table, column, .. } => vec![format!(
                "ALTER TABLE {} DROP COLUMN {}",
                self.quote_identifier(table),
                self.quote_identifier(column)
            )],
            Operation::RenameColumn { table, from, to, unique } => {
                let mut statements = vec![format!(
                    "ALTER TABLE {} RENAME COLUMN {} TO {}",
                    self.quote_identifier(table),
                    self.quote_identifier(from),
                    self.quote_identifier(to)
                )];
                if *unique {
                    statements.extend(self.rename_unique_constraint(table, from, to));
                }
                statements
            }
            Operation::AlterColumn { table, from, to } => self.alter_column(operation, table, from.as_ref(), to)?,
            Operation::AddIndex { table, index } => vec![self.create_index(table, index)],
            Operation::DropIndex { table, name, .. } => match self {
                SqlDialect::MySQL => vec![format!(
                    "DROP INDEX {} ON {}",
                    self.quote_identifier(name),
                    self.quote_identifier(table)
                )],
                _ => vec![format!("DROP INDEX {}", self.quote_identifier(name))],
            },
            Operation::AddForeignKey { table, foreign_key } => {
                self.require_alter_constraints(operation)?;
                vec![format!(
                    "ALTER TABLE {} ADD {}",
                    self.quote_identifier(table),
                    self.foreign_key_constraint(foreign_key)
                )]
            }
            Operation::DropForeignKey { table, name, .. } => {
                self.require_alter_constraints(operation)?;
                let keyword = match self {
                    SqlDialect::MySQL => "FOREIGN KEY",
                    _ => "CONSTRAINT",
                };
                vec![format!(
                    "ALTER TABLE {} DROP {} {}",
                    self.quote_identifier(table),
                    keyword,
                    self.quote_identifier(name)
                )]
            }
            Operation::RunSql { sql, .. } => split_statements(sql),
        };

        Ok(statements)
    }

    fn create_table(&self, table: &TableDefinition) -> Vec<String> {
        let mut clauses: Vec<String> = table
            .columns
            .iter()
            .map(|column| self.column_definition(column))
            .collect();
        clauses.extend(
            table
                .foreign_keys
                .iter()
                .map(|foreign_key| self.foreign_key_constraint(foreign_key)),
        );

        let mut statements = vec![format!(
            "CREATE TABLE {} (\n    {}\n)",
            self.quote_identifier(&table.name),
            clauses.join(",\n    ")
        )];
        statements.extend(
            table
                .indexes
                .iter()
                .map(|index| self.create_index(&table.name, index)),
        );
        statements
    }

    fn create_index(&self, table: &str, index: &IndexDefinition) -> String {
        let columns: Vec<String> = index
            .columns
            .iter()
            .map(|column| self.quote_identifier(column))
            .collect();
        format!(
            "CREATE {}INDEX {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            self.quote_identifier(&index.name),
            self.quote_identifier(table),
            columns.join(", ")
        )
    }

    fn foreign_key_constraint(&self, foreign_key: &ForeignKeyDefinition) -> String {
        format!(
            "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {}",
            self.quote_identifier(&foreign_key.name),
            self.quote_identifier(&foreign_key.column),
            self.quote_identifier(&foreign_key.references_table),
            self.quote_identifier(&foreign_key.references_column),
            foreign_key.on_delete.as_sql()
        )
    }

    /// Inline UNIQUE constraints are named after their column; keep the name
    /// in step with a column rename
    fn rename_unique_constraint(&self, table: &str, from: &str, to: &str) -> Option<String> {
        let table_sql = self.quote_identifier(table);
        match self {
            SqlDialect::PostgreSQL => Some(format!(
                "ALTER TABLE {} RENAME CONSTRAINT {} TO {}",
                table_sql,
                self.quote_identifier(&unique_constraint_name(table, from)),
                self.quote_identifier(&unique_constraint_name(table, to))
            )),
            SqlDialect::MySQL => Some(format!(
                "ALTER TABLE {} RENAME INDEX {} TO {}",
                table_sql,
                self.quote_identifier(from),
                self.quote_identifier(to)
            )),
            // SQLite keeps its autoindex attached to the column
            SqlDialect::SQLite => None,
        }
    }

    fn require_alter_constraints(&self, operation: &Operation) -> MigrationResult<()> {
        if *self == SqlDialect::SQLite {
            return Err(self.unsupported(operation));
        }
        Ok(())
    }

    fn unsupported(&self, operation: &Operation) -> MigrationError {
        MigrationError::Unsupported {
            dialect: self.to_string(),
            operation: operation.describe(),
        }
    }

    fn alter_column(
        &self,
        operation: &Operation,
        table: &str,
        from: Option<&ColumnDefinition>,
        to: &ColumnDefinition,
    ) -> MigrationResult<Vec<String>> {
        let table_sql = self.quote_identifier(table);
        let column_sql = self.quote_identifier(&to.name);

        match self {
            SqlDialect::SQLite => Err(self.unsupported(operation)),
            SqlDialect::MySQL => {
                let mut statements = vec![format!(
                    "ALTER TABLE {} MODIFY COLUMN {}",
                    table_sql,
                    self.column_definition(to)
                )];
                // MODIFY COLUMN keeps an existing unique index
                if from.map_or(false, |from| from.unique) && !to.unique {
                    statements.push(format!("ALTER TABLE {} DROP INDEX {}", table_sql, column_sql));
                }
                Ok(statements)
            }
            SqlDialect::PostgreSQL => {
                let changed = |same: fn(&ColumnDefinition, &ColumnDefinition) -> bool| {
                    from.map(|from| !same(from, to)).unwrap_or(true)
                };
                let mut statements = Vec::new();

                if changed(|a, b| a.column_type == b.column_type) {
                    let target_type = self.column_type(&to.column_type);
                    statements.push(format!(
                        "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}::{}",
                        table_sql, column_sql, target_type, column_sql, target_type
                    ));
                }
                if changed(|a, b| a.nullable == b.nullable) && !to.primary_key {
                    let action = if to.nullable { "DROP NOT NULL" } else { "SET NOT NULL" };
                    statements.push(format!("ALTER TABLE {} ALTER COLUMN {} {}", table_sql, column_sql, action));
                }
                if changed(|a, b| a.default == b.default) {
                    let action = match &to.default {
                        Some(default) => format!("SET DEFAULT {}", default),
                        None => "DROP DEFAULT".to_string(),
                    };
                    statements.push(format!("ALTER TABLE {} ALTER COLUMN {} {}", table_sql, column_sql, action));
                }
                if changed(|a, b| a.unique == b.unique) {
                    let constraint = self.quote_identifier(&unique_constraint_name(table, &to.name));
                    if to.unique {
                        statements.push(format!(
                            "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({})",
                            table_sql, constraint, column_sql
                        ));
                    } else if from.is_some() {
                        statements.push(format!("ALTER TABLE {} DROP CONSTRAINT {}", table_sql, constraint));
                    }
                }
                if changed(|a, b| a.primary_key == b.primary_key) {
                    if to.primary_key {
                        statements.push(format!("ALTER TABLE {} ADD PRIMARY KEY ({})", table_sql, column_sql));
                    } else if from.is_some() {
                        let constraint = self.quote_identifier(&format!("{}_pkey", table));
                        statements.push(format!("ALTER TABLE {} DROP CONSTRAINT {}", table_sql, constraint));
                    }
                }

                Ok(statements)
            }
        }
    }
}

/// Name PostgreSQL gives an inline UNIQUE constraint
fn unique_constraint_name(table: &str, column: &str) -> String {
    format!("{}_{}_key", table, column)
}

/// Split a SQL script into individual statements
pub fn split_statements(sql: &str) -> Vec<String> {
    let dialect = GenericDialect {};

    match Parser::parse_sql(&dialect, sql) {
        Ok(parsed) => parsed.into_iter().map(|stmt| format!("{};", stmt)).collect(),
        Err(e) => {
            tracing::warn!("SQL parsing failed, using naive semicolon splitting: {}", e);
            sql.split(';')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| format!("{};", s))
                .collect()
        }
    }
}
