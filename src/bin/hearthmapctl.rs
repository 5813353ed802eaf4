use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hearthmap::jobs::{processor, pruning, repair, sessions};
use hearthmap::engine::{LogNotifier, Notifier};
use hearthmap::storage::Store;
use hearthmap::storage::sqlite3::SqliteStore;
use hearthmap::util::paths;
use hearthmap_common::cache::{CacheHandle, MemoryCache};
use hearthmap_common::config::AppConfig;
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about = "hearthmap admin tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Recompute every (zone, member) membership flag from current locations
    RepairGeofences,
    /// Apply per-family retention to history and audit events
    Prune,
    /// Mark overdue live sessions expired
    ExpireSessions,
    /// Run one geofence queue drain immediately
    ProcessQueue,
    /// Show geofence queue depth
    QueueStats,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = AppConfig::load().context("load configuration")?;
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::new(paths::db_file(&config.workspace_dir)).context("open store")?,
    );
    let cache: Arc<dyn CacheHandle> = Arc::new(MemoryCache::new());

    match cli.command {
        Commands::RepairGeofences => {
            let summary = repair::recompute_geofence_states(store.as_ref(), cache.as_ref())?;
            println!(
                "checked {} zone/member pairs, fixed {} drifted states",
                summary.pairs_checked, summary.states_fixed
            );
        }
        Commands::Prune => {
            let summary =
                pruning::run_retention_prune(store.as_ref(), &pruning::PruneConfig::from(&config))?;
            println!(
                "pruned {} history rows and {} event rows across {} families",
                summary.history_rows, summary.event_rows, summary.families
            );
        }
        Commands::ExpireSessions => {
            let expired = sessions::expire_overdue(store.as_ref(), cache.as_ref())?;
            println!("expired {} sessions", expired);
        }
        Commands::ProcessQueue => {
            let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
            let summary = processor::run_once(
                &store,
                &cache,
                &notifier,
                &processor::ProcessorConfig::from(&config),
            )?;
            println!(
                "claimed {} processed {} failed {} pruned {}",
                summary.claimed, summary.processed, summary.failed, summary.pruned
            );
        }
        Commands::QueueStats => {
            let depth = store.queue_depth()?;
            println!("pending: {}  failed: {}", depth.pending, depth.failed);
        }
    }

    Ok(())
}
