mod commands;

use clap::{Parser, Subcommand};
use elif_migrate::MigrationConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use commands::*;

#[derive(Parser)]
#[command(name = "elif-migrate")]
#[command(about = "Schema migrations for elif.rs applications")]
struct Cli {
    /// Migrations directory (overrides MIGRATIONS_DIR)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the migrations a run towards TARGET would apply or revert
    Plan {
        /// latest, zero or namespace.name
        #[arg(default_value = "latest")]
        target: String,
    },

    /// Apply migrations up to TARGET
    Apply {
        /// latest, zero or namespace.name
        #[arg(default_value = "latest")]
        target: String,
    },

    /// Revert migrations back to TARGET
    Revert {
        /// zero or namespace.name
        target: String,
    },

    /// List every migration with its state on the target database
    List,

    /// Generate the next migration of NAMESPACE from a schema declaration
    Make {
        /// Namespace owning the declared tables
        namespace: String,

        /// YAML or JSON schema declaration
        #[arg(long)]
        schema: PathBuf,

        /// Rename hint, e.g. person.name:full_name
        #[arg(long = "rename", value_name = "TABLE.FROM:TO")]
        renames: Vec<String>,

        /// Treat every removed/added column pair as drop + add
        #[arg(long)]
        no_detect_renames: bool,

        /// Print the proposed migration without writing it
        #[arg(long)]
        dry_run: bool,
    },

    /// Write a merge migration for a namespace with several leaves
    Merge {
        namespace: String,
    },
}

fn init_tracing(config: &MigrationConfig, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = MigrationConfig::from_env()?;
    if let Some(dir) = cli.dir {
        config.migrations_dir = dir;
    }
    config.validate()?;
    init_tracing(&config, cli.json_logs);

    match cli.command {
        Commands::Plan { target } => {
            migrate::plan(&config, &target).await?;
        }
        Commands::Apply { target } => {
            migrate::apply(&config, &target).await?;
        }
        Commands::Revert { target } => {
            migrate::revert(&config, &target).await?;
        }
        Commands::List => {
            migrate::list(&config).await?;
        }
        Commands::Make {
            namespace,
            schema,
            renames,
            no_detect_renames,
            dry_run,
        } => {
            make::make(&config, &namespace, &schema, &renames, !no_detect_renames, dry_run)?;
        }
        Commands::Merge { namespace } => {
            make::merge(&config, &namespace)?;
        }
    }

    Ok(())
}
