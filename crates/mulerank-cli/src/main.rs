use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mulerank_core::history_with_movements;
use mulerank_storage::{connect_store, AgentStore, SnapshotStore};
use mulerank_sync::{build_pipeline, recent_run_reports, Scheduler, SyncConfig};
use tracing::info;
use uuid::Uuid;

mod format;
mod logging;

#[derive(Debug, Parser)]
#[command(name = "mulerank")]
#[command(about = "Tracks the MuleRun agent listing and its rank history")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RunMode {
    Once,
    Daemon,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl the listing once, or keep crawling on the configured interval.
    Run {
        #[arg(long, value_enum, default_value_t = RunMode::Once)]
        mode: RunMode,
        /// In daemon mode, wait one interval before the first crawl.
        #[arg(long)]
        no_immediate: bool,
    },
    /// List agents by rank.
    List {
        #[arg(long)]
        active_only: bool,
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Show the rank history of one agent, e.g. `/@laughing_code/video-maker`.
    History { link: String },
    Stats {
        /// Also show the largest rank movements between the last two crawls.
        #[arg(long)]
        show_changes: bool,
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
    /// Summaries of the most recent runs, newest first.
    Reports {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Raw listing pages kept for one run.
    Snapshots { run_id: Uuid },
    /// Create or upgrade the database schema.
    Migrate,
    /// Serve the HTTP API, with the crawl scheduler unless disabled.
    Serve {
        #[arg(long)]
        no_scheduler: bool,
    },
}

async fn open_store(config: &SyncConfig) -> Result<Arc<dyn AgentStore>> {
    connect_store(&config.database_url, config.database_max_connections)
        .await
        .context("connecting to the agent store")
}

async fn run(mode: RunMode, no_immediate: bool) -> Result<()> {
    let config = SyncConfig::from_env()?;
    info!(?mode, interval_hours = config.interval_hours, "mulerank starting");
    let pipeline = build_pipeline(config).await?;
    match mode {
        RunMode::Once => {
            let summary = pipeline.run_once().await?;
            println!("{}", format::run_summary(&summary));
        }
        RunMode::Daemon => {
            Scheduler::new(Arc::new(pipeline))
                .run_until_shutdown(!no_immediate)
                .await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    logging::init_logging(&logging::LogSettings::from_env());
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run {
        mode: RunMode::Once,
        no_immediate: false,
    }) {
        Commands::Run { mode, no_immediate } => run(mode, no_immediate).await?,
        Commands::List { active_only, limit } => {
            let store = open_store(&SyncConfig::from_env()?).await?;
            let agents = store.list_agents(active_only, limit).await?;
            print!("{}", format::agent_list(&agents, active_only));
        }
        Commands::History { link } => {
            let store = open_store(&SyncConfig::from_env()?).await?;
            let Some(agent) = store.get_agent(&link).await? else {
                bail!("agent {link} not found");
            };
            let history = store.get_history(&link).await?;
            print!("{}", format::history_table(&agent, &history_with_movements(&history)));
        }
        Commands::Stats { show_changes, limit } => {
            let store = open_store(&SyncConfig::from_env()?).await?;
            let stats = store.get_stats().await?;
            let changes = if show_changes {
                Some(store.rank_changes(limit).await?)
            } else {
                None
            };
            print!("{}", format::stats_report(&stats, changes.as_deref()));
        }
        Commands::Reports { limit } => {
            let config = SyncConfig::from_env()?;
            let reports = recent_run_reports(&config.reports_dir, limit).await?;
            print!("{}", format::report_list(&reports));
        }
        Commands::Snapshots { run_id } => {
            let config = SyncConfig::from_env()?;
            let pages = SnapshotStore::new(config.artifacts_dir).pages_for_run(run_id).await?;
            print!("{}", format::snapshot_list(run_id, &pages));
        }
        Commands::Migrate => {
            let store = open_store(&SyncConfig::from_env()?).await?;
            store.init_schema().await.context("applying migrations")?;
            println!("schema is up to date");
        }
        Commands::Serve { no_scheduler } => mulerank_web::serve_from_env(!no_scheduler).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_defaults_to_once() {
        let cli = Cli::parse_from(["mulerank", "run"]);
        assert!(matches!(
            cli.command,
            Some(Commands::Run {
                mode: RunMode::Once,
                no_immediate: false
            })
        ));
    }

    #[test]
    fn daemon_mode_and_query_flags_parse() {
        let cli = Cli::parse_from(["mulerank", "run", "--mode", "daemon", "--no-immediate"]);
        assert!(matches!(
            cli.command,
            Some(Commands::Run {
                mode: RunMode::Daemon,
                no_immediate: true
            })
        ));

        let cli = Cli::parse_from(["mulerank", "list", "--active-only", "--limit", "20"]);
        assert!(matches!(
            cli.command,
            Some(Commands::List {
                active_only: true,
                limit: Some(20)
            })
        ));

        let cli = Cli::parse_from(["mulerank", "history", "/@inkwell/resume"]);
        assert!(matches!(cli.command, Some(Commands::History { link }) if link == "/@inkwell/resume"));

        let cli = Cli::parse_from(["mulerank", "reports"]);
        assert!(matches!(cli.command, Some(Commands::Reports { limit: 10 })));

        let run_id = Uuid::new_v4();
        let cli = Cli::parse_from(["mulerank".to_string(), "snapshots".to_string(), run_id.to_string()]);
        assert!(matches!(cli.command, Some(Commands::Snapshots { run_id: parsed }) if parsed == run_id));
        assert!(Cli::try_parse_from(["mulerank", "snapshots", "not-a-run"]).is_err());
    }
}
