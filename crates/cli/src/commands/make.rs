use anyhow::{anyhow, Context};
use elif_migrate::{merge_node, DiffEngine, DiffOptions, MigrationConfig, MigrationManager, SchemaDeclaration};
use std::path::Path;

pub fn make(
    config: &MigrationConfig,
    namespace: &str,
    schema: &Path,
    renames: &[String],
    detect_renames: bool,
    dry_run: bool,
) -> anyhow::Result<()> {
    let manager = MigrationManager::with_config(config.clone());
    let graph = manager.load_graph()?;
    let desired = SchemaDeclaration::from_path(schema)
        .with_context(|| format!("Failed to read schema declaration {}", schema.display()))?;

    let mut options = DiffOptions::new().detect_renames(detect_renames);
    for hint in renames {
        let (table, from, to) = parse_rename(hint)?;
        options = options.rename(table, from, to);
    }

    let Some(node) = DiffEngine::with_options(options).propose_node(&graph, namespace, &desired)? else {
        println!("No changes detected in {}", namespace);
        return Ok(());
    };

    println!("{}", node.id());
    for operation in &node.operations {
        println!("  - {}", operation.describe());
    }

    if !dry_run {
        let path = manager.write_node(&node)?;
        println!("Created migration: {}", path.display());
    }
    Ok(())
}

pub fn merge(config: &MigrationConfig, namespace: &str) -> anyhow::Result<()> {
    let manager = MigrationManager::with_config(config.clone());
    let graph = manager.load_graph()?;

    match merge_node(&graph, namespace)? {
        Some(node) => {
            let path = manager.write_node(&node)?;
            println!("Created merge migration: {}", path.display());
        }
        None => println!("{} has a single leaf, nothing to merge", namespace),
    }
    Ok(())
}

/// `table.from:to`
fn parse_rename(hint: &str) -> anyhow::Result<(String, String, String)> {
    let invalid = || anyhow!("invalid rename '{}', expected TABLE.FROM:TO", hint);

    let (column, to) = hint.split_once(':').ok_or_else(invalid)?;
    let (table, from) = column.split_once('.').ok_or_else(invalid)?;
    if [table, from, to].iter().any(|part| part.trim().is_empty()) {
        return Err(invalid());
    }
    Ok((table.trim().to_string(), from.trim().to_string(), to.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_parse_rename() {
        assert_eq!(
            parse_rename("person.name:full_name").unwrap(),
            ("person".to_string(), "name".to_string(), "full_name".to_string())
        );
        assert!(parse_rename("person.name").is_err());
        assert!(parse_rename("name:full_name").is_err());
        assert!(parse_rename("person.:full_name").is_err());
    }

    #[test]
    fn test_make_writes_next_migration() {
        let dir = tempfile::tempdir().unwrap();
        let schema = dir.path().join("people.yaml");
        fs::write(
            &schema,
            "tables:\n  - name: person\n    columns:\n      - name: name\n        type: varchar(20)\n",
        )
        .unwrap();

        let config = MigrationConfig {
            migrations_dir: dir.path().join("migrations"),
            ..Default::default()
        };

        make(&config, "people", &schema, &[], true, true).unwrap();
        assert!(!config.migrations_dir.exists());

        make(&config, "people", &schema, &[], true, false).unwrap();
        assert!(config.migrations_dir.join("people/0001_initial.json").exists());

        make(&config, "people", &schema, &[], true, false).unwrap();
        assert_eq!(fs::read_dir(config.migrations_dir.join("people")).unwrap().count(), 1);

        merge(&config, "people").unwrap();
        assert_eq!(fs::read_dir(config.migrations_dir.join("people")).unwrap().count(), 1);
    }
}
