pub mod processor;
pub mod pruning;
pub mod repair;
pub mod sessions;

use crate::engine::Notifier;
use crate::util::logging::{error, info};
use anyhow::Result;
use crossbeam_channel::{Receiver, Sender, tick};
use hearthmap_common::cache::CacheHandle;
use hearthmap_common::config::AppConfig;
use hearthmap_common::threading::{ThreadHandle, ThreadRegistry};
use hearthmap_storage::Store;
use std::sync::Arc;
use std::time::Duration;

/// Tick-driven background workers: the geofence queue processor, the session
/// expiry sweep, and retention pruning. The geofence-state repair tool is
/// operator-invoked and not scheduled here.
pub struct Scheduler {
    shutdown_tx: Option<Sender<()>>,
    handles: Vec<ThreadHandle>,
}

impl Scheduler {
    pub fn start(
        store: Arc<dyn Store>,
        cache: Arc<dyn CacheHandle>,
        notifier: Arc<dyn Notifier>,
        cfg: &AppConfig,
        threads: &ThreadRegistry,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);
        let mut handles = Vec::new();

        {
            let store = Arc::clone(&store);
            let cache = Arc::clone(&cache);
            let notifier = Arc::clone(&notifier);
            let processor_cfg = processor::ProcessorConfig::from(cfg);
            handles.push(spawn_periodic(
                threads,
                "job-queue-processor",
                Duration::from_secs(cfg.processor_interval_secs),
                shutdown_rx.clone(),
                move || {
                    match processor::run_once(&store, &cache, &notifier, &processor_cfg) {
                        Ok(summary) if summary.skipped => {}
                        Ok(summary) => info!(
                            "queue run: claimed {} processed {} failed {} pruned {}",
                            summary.claimed, summary.processed, summary.failed, summary.pruned
                        ),
                        Err(e) => error!("queue processor run failed: {:#}", e),
                    }
                },
            )?);
        }

        {
            let store = Arc::clone(&store);
            let cache = Arc::clone(&cache);
            handles.push(spawn_periodic(
                threads,
                "job-session-sweep",
                Duration::from_secs(cfg.session_sweep_interval_secs),
                shutdown_rx.clone(),
                move || match sessions::expire_overdue(store.as_ref(), cache.as_ref()) {
                    Ok(0) => {}
                    Ok(expired) => info!("expired {} overdue sessions", expired),
                    Err(e) => error!("session sweep failed: {:#}", e),
                },
            )?);
        }

        {
            let store = Arc::clone(&store);
            let prune_cfg = pruning::PruneConfig::from(cfg);
            handles.push(spawn_periodic(
                threads,
                "job-retention-prune",
                Duration::from_secs(cfg.prune_interval_secs),
                shutdown_rx,
                move || match pruning::run_retention_prune(store.as_ref(), &prune_cfg) {
                    Ok(summary) if summary.history_rows == 0 && summary.event_rows == 0 => {}
                    Ok(summary) => info!(
                        "retention prune: {} history rows, {} event rows across {} families",
                        summary.history_rows, summary.event_rows, summary.families
                    ),
                    Err(e) => error!("retention prune failed: {:#}", e),
                },
            )?);
        }

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handles,
        })
    }

    /// Signals every worker and joins them.
    pub fn shutdown(mut self) {
        // Dropping the sender disconnects all tick loops.
        self.shutdown_tx.take();
        for handle in self.handles.drain(..) {
            let name = handle.name().to_string();
            if handle.join().is_err() {
                error!("job thread '{}' panicked", name);
            }
        }
    }
}

fn spawn_periodic<F>(
    threads: &ThreadRegistry,
    name: &str,
    interval: Duration,
    shutdown_rx: Receiver<()>,
    mut job: F,
) -> Result<ThreadHandle>
where
    F: FnMut() + Send + 'static,
{
    let thread_name = name.to_string();
    threads.spawn(name, move || {
        info!("{} started (every {:?})", thread_name, interval);
        let ticker = tick(interval);
        loop {
            crossbeam_channel::select! {
                recv(shutdown_rx) -> _ => break,
                recv(ticker) -> _ => job(),
            }
        }
        info!("{} exiting", thread_name);
    })
}
