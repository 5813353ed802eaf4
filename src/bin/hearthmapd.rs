use hearthmap::engine::{LogNotifier, Notifier};
use hearthmap::jobs::Scheduler;
use hearthmap::storage::Store;
use hearthmap::storage::sqlite3::SqliteStore;
use hearthmap::util::paths;
use hearthmap::util::run_id::new_run_id;
use hearthmap_common::cache::{CacheHandle, MemoryCache};
use hearthmap_common::config::AppConfig;
use hearthmap_common::threading::ThreadRegistry;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn ensure_workspace_dir(workspace_dir: &PathBuf) {
    if !workspace_dir.exists() {
        std::fs::create_dir_all(workspace_dir).unwrap_or_else(|e| {
            eprintln!("Failed to create workspace directory: {}", e);
            std::process::exit(1);
        });
    }
}

fn is_process_running(pid: u32) -> bool {
    std::process::Command::new("ps")
        .args(["-p", &pid.to_string()])
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn write_pid_file(pid_file: &PathBuf) {
    if pid_file.exists() {
        match std::fs::read_to_string(pid_file) {
            Ok(content) => {
                if let Ok(existing_pid) = content.trim().parse::<u32>() {
                    if is_process_running(existing_pid) {
                        eprintln!("hearthmap daemon is already running (PID: {})", existing_pid);
                        std::process::exit(1);
                    } else {
                        info!(
                            "Removing stale PID file (process {} no longer exists)",
                            existing_pid
                        );
                        let _ = std::fs::remove_file(pid_file);
                    }
                }
            }
            Err(_) => {
                info!("Removing unreadable PID file");
                let _ = std::fs::remove_file(pid_file);
            }
        }
    }

    let current_pid = std::process::id();
    std::fs::write(pid_file, current_pid.to_string()).unwrap_or_else(|e| {
        eprintln!("Failed to write PID file: {}", e);
        std::process::exit(1);
    });
}

fn cleanup_pid_file(pid_file: &PathBuf) {
    let current_pid = std::process::id();
    match std::fs::read_to_string(pid_file) {
        Ok(content) => match content.trim().parse::<u32>() {
            Ok(file_pid) if file_pid == current_pid => {
                if let Err(e) = std::fs::remove_file(pid_file) {
                    error!("Failed to remove PID file: {}", e);
                }
            }
            Ok(file_pid) => {
                error!(
                    "PID file contains different PID ({}) than current process ({}). Not removing it.",
                    file_pid, current_pid
                );
            }
            Err(e) => error!("PID file contains invalid PID: {}", e),
        },
        Err(e) => error!("Failed to read PID file for cleanup: {}", e),
    }
}

fn setup_file_logging(log_dir: &PathBuf) {
    std::fs::create_dir_all(log_dir).unwrap_or_else(|e| {
        eprintln!("Failed to create log directory: {}", e);
        std::process::exit(1);
    });

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("hearthmapd")
        .filename_suffix("log")
        .max_log_files(7)
        .build(log_dir)
        .unwrap_or_else(|e| {
            eprintln!("Failed to create log appender: {}", e);
            std::process::exit(1);
        });

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .with_timer(fmt::time::ChronoUtc::new(
                    "%Y-%m-%dT%H:%M:%S%.6fZ".to_string(),
                )),
        )
        .with(env_filter)
        .init();
}

fn load_app_config() -> AppConfig {
    match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    }
}

fn main() {
    let config = load_app_config();
    ensure_workspace_dir(&config.workspace_dir);

    let log_dir = paths::log_dir(&config.workspace_dir);
    setup_file_logging(&log_dir);

    let pid_file = paths::pid_file(&config.workspace_dir);
    write_pid_file(&pid_file);

    let run_id = new_run_id();
    hearthmap::util::logging::set_run_id(run_id.clone());
    info!("Starting hearthmap daemon (run {})", run_id);

    let store: Arc<dyn Store> = match SqliteStore::new(paths::db_file(&config.workspace_dir)) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open store: {:#}", e);
            std::process::exit(1);
        }
    };
    let cache: Arc<dyn CacheHandle> = Arc::new(MemoryCache::new());
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);

    let threads = ThreadRegistry::new();
    let scheduler = match Scheduler::start(store, cache, notifier, &config, &threads) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            error!("Failed to start job scheduler: {:#}", e);
            cleanup_pid_file(&pid_file);
            std::process::exit(1);
        }
    };

    info!(
        "Background jobs running: {:?}",
        threads.active_thread_names()
    );

    // Park the main thread until the process is asked to stop.
    let rt = runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("build signal runtime");
    if let Err(e) = rt.block_on(tokio::signal::ctrl_c()) {
        error!("Failed to wait for shutdown signal: {}", e);
    }

    info!("Shutdown signal received; stopping jobs");
    scheduler.shutdown();
    cleanup_pid_file(&pid_file);
    info!("hearthmap daemon stopped");
}
