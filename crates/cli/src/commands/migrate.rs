use anyhow::{bail, Context};
use elif_migrate::{
    CancellationFlag, MigrationConfig, MigrationError, MigrationManager, MigrationNode, MigrationRunner, MigrationTarget,
    NodeState, PlanDirection, PlanStep, PostgresConnection, SqlStateStore, TargetDatabase,
};
use tracing::warn;

fn runner(config: &MigrationConfig) -> anyhow::Result<MigrationRunner<SqlStateStore>> {
    let graph = MigrationManager::with_config(config.clone())
        .load_graph()
        .with_context(|| format!("Failed to load migrations from {}", config.migrations_dir.display()))?;

    Ok(MigrationRunner::new(graph, SqlStateStore::new(config.migrations_table.clone()))
        .with_options(config.runner_options()))
}

fn untouched(err: MigrationError, database: &TargetDatabase) -> MigrationError {
    if err.is_planning_error() {
        warn!("Nothing was changed on {}", database);
    }
    err
}

async fn connect(config: &MigrationConfig) -> anyhow::Result<(PostgresConnection, TargetDatabase)> {
    let database = config.target_database()?;
    let conn = PostgresConnection::connect(config.database_url()?)
        .await
        .with_context(|| format!("Failed to connect to {}", database))?;
    Ok((conn, database))
}

pub async fn plan(config: &MigrationConfig, target: &str) -> anyhow::Result<()> {
    let target: MigrationTarget = target.parse()?;
    let runner = runner(config)?;
    let (mut conn, database) = connect(config).await?;

    let plan = runner
        .plan(&mut conn, &database, &target)
        .await
        .map_err(|err| untouched(err, &database))?;
    conn.close().await?;

    if plan.is_empty() {
        println!("{} is already at {}", database, target);
        return Ok(());
    }

    println!("Plan for {} towards {}:", database, target);
    for step in &plan.steps {
        println!("{}", describe_step(step, runner.graph().node(&step.node)));
    }
    Ok(())
}

fn describe_step(step: &PlanStep, node: Option<&MigrationNode>) -> String {
    let marker = match step.direction {
        PlanDirection::Forwards => "+",
        PlanDirection::Backwards => "-",
    };
    let mut line = format!("  {} {}", marker, step.node);
    let Some(node) = node else {
        return line;
    };
    if !node.is_reversible() {
        line.push_str(" (irreversible)");
    }
    for operation in &node.operations {
        line.push_str(&format!("\n      {}", operation.describe()));
    }
    line
}

pub async fn apply(config: &MigrationConfig, target: &str) -> anyhow::Result<()> {
    let target: MigrationTarget = target.parse()?;
    run(config, &target).await
}

pub async fn revert(config: &MigrationConfig, target: &str) -> anyhow::Result<()> {
    let target: MigrationTarget = target.parse()?;
    if target == MigrationTarget::Latest {
        bail!("revert needs 'zero' or a migration such as people.0001_initial");
    }
    run(config, &target).await
}

async fn run(config: &MigrationConfig, target: &MigrationTarget) -> anyhow::Result<()> {
    let runner = runner(config)?;
    let (mut conn, database) = connect(config).await?;

    let cancel = CancellationFlag::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current migration");
            on_interrupt.cancel();
        }
    });

    let report = runner
        .migrate(&mut conn, &database, target, &cancel)
        .await
        .map_err(|err| untouched(err, &database))?;
    conn.close().await?;

    for node in &report.applied {
        println!("Applied {}", node);
    }
    for node in &report.unapplied {
        println!("Reverted {}", node);
    }
    if report.applied.is_empty() && report.unapplied.is_empty() {
        println!("{} is already at {}", database, target);
    }
    if report.cancelled {
        println!("Stopped early on request; run again to continue");
    }
    println!("Run {} finished in {}ms", report.run_id, report.execution_time_ms);
    Ok(())
}

pub async fn list(config: &MigrationConfig) -> anyhow::Result<()> {
    let runner = runner(config)?;
    let (mut conn, database) = connect(config).await?;

    let statuses = runner.status(&mut conn, &database).await?;
    conn.close().await?;

    println!("Migrations on {}:", database);
    if statuses.is_empty() {
        println!("  (none)");
    }
    for status in statuses {
        match (status.state, status.applied_at) {
            (NodeState::Applied, Some(applied_at)) => {
                println!("  [X] {} ({})", status.node, applied_at.format("%Y-%m-%d %H:%M:%S UTC"))
            }
            _ => println!("  [ ] {}", status.node),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use elif_migrate::Operation;

    #[test]
    fn test_plan_step_flags_irreversible_nodes() {
        let node = MigrationNode::new("people", "0002_backfill").add_operation(Operation::RunSql {
            sql: "UPDATE person SET age = 0".to_string(),
            reverse_sql: None,
        });
        let step = PlanStep {
            node: node.id(),
            direction: PlanDirection::Forwards,
        };

        assert_eq!(
            describe_step(&step, Some(&node)),
            "  + people.0002_backfill (irreversible)\n      Run SQL"
        );
        assert_eq!(describe_step(&step, None), "  + people.0002_backfill");

        let reversible = MigrationNode::new("people", "0002_backfill").add_operation(Operation::RunSql {
            sql: "UPDATE person SET age = 0".to_string(),
            reverse_sql: Some("UPDATE person SET age = NULL".to_string()),
        });
        let step = PlanStep {
            node: reversible.id(),
            direction: PlanDirection::Backwards,
        };
        assert_eq!(describe_step(&step, Some(&reversible)), "  - people.0002_backfill\n      Run SQL");
    }

    #[test]
    fn test_planning_errors_pass_through() {
        let database = TargetDatabase::new("memory/app");
        let err = untouched(MigrationError::UnknownTarget("people.0009".to_string()), &database);
        assert!(matches!(err, MigrationError::UnknownTarget(_)));
    }
}
