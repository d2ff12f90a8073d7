use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use check_scheduler::config::{SchedulerConfig, log_dir};
use check_scheduler::db::{CheckFactory, Database, ResourceConfigFactory, SqliteCheckFactory};
use check_scheduler::logging::init_logging;

#[derive(Parser)]
#[command(name = "check-scheduler")]
#[command(version, about = "Inspect and maintain the check scheduler database")]
struct Cli {
    /// JSON config file; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create or upgrade the database schema
    Migrate,
    /// Print the latest version of each space of a resource config as JSON
    Latest { config_id: i64 },
    /// Print the checks waiting to be dispatched as JSON
    Checks,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SchedulerConfig::load(path)?,
        None => SchedulerConfig::default(),
    };
    let _guard = init_logging(&log_dir()).context("failed to set up logging")?;

    let db_path = config.db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let db = Arc::new(Database::open(&db_path)?);

    match cli.command {
        Command::Migrate => {
            info!("Database at {:?} is up to date", db_path);
        }
        Command::Latest { config_id } => {
            let configs = ResourceConfigFactory::new(db);
            let resource_config = configs
                .find_resource_config_by_id(config_id)?
                .with_context(|| format!("resource config {config_id} not found"))?;
            let latest = resource_config.latest_versions()?;
            println!("{}", serde_json::to_string_pretty(&latest)?);
        }
        Command::Checks => {
            let checks = SqliteCheckFactory::new(db).started_checks()?;
            println!("{}", serde_json::to_string_pretty(&checks)?);
        }
    }

    Ok(())
}
