use anyhow::Result;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub workspace_dir: PathBuf,
    // Ingest gates
    pub rate_limit_per_minute: u32,
    pub dedupe_min_distance_m: f64,
    // When true, geofence/alert evaluation runs on the write path instead of
    // going through the durable queue.
    pub inline_processing: bool,
    // Sessions
    pub session_max_duration_secs: u64,
    pub session_sweep_interval_secs: u64,
    // Per-family defaults; family_settings rows override these.
    pub default_retention_days: u32,
    pub default_speed_limit_kmh: f64,
    pub default_low_battery_pct: f64,
    pub default_update_interval_secs: u32,
    // Queue processor
    pub processor_interval_secs: u64,
    pub processor_batch_size: usize,
    pub processor_time_budget_secs: u64,
    pub processor_retry_window_secs: u64,
    // Retention pruning
    pub prune_interval_secs: u64,
    pub prune_batch_size: usize,
    pub prune_batch_pause_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        let base_dir = dirs::home_dir()
            .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        let workspace_dir = base_dir.join(".hearthmap");

        Self {
            workspace_dir,
            rate_limit_per_minute: 10,
            dedupe_min_distance_m: 10.0,
            inline_processing: false,
            session_max_duration_secs: 2 * 3600,
            session_sweep_interval_secs: 60,
            default_retention_days: 90,
            default_speed_limit_kmh: 120.0,
            default_low_battery_pct: 15.0,
            default_update_interval_secs: 30,
            processor_interval_secs: 60,
            processor_batch_size: 50,
            processor_time_budget_secs: 55,
            processor_retry_window_secs: 3600,
            prune_interval_secs: 3600,
            prune_batch_size: 500,
            prune_batch_pause_ms: 50,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let workspace_dir = Self::default().workspace_dir;
        let config_path = workspace_dir.join("config.toml");

        let mut builder = Config::builder()
            .set_default("workspace_dir", workspace_dir.to_string_lossy().as_ref())?
            .set_default("rate_limit_per_minute", 10)?
            .set_default("dedupe_min_distance_m", 10.0)?
            .set_default("inline_processing", false)?
            .set_default("session_max_duration_secs", 2 * 3600)?
            .set_default("session_sweep_interval_secs", 60)?
            .set_default("default_retention_days", 90)?
            .set_default("default_speed_limit_kmh", 120.0)?
            .set_default("default_low_battery_pct", 15.0)?
            .set_default("default_update_interval_secs", 30)?
            .set_default("processor_interval_secs", 60)?
            .set_default("processor_batch_size", 50)?
            .set_default("processor_time_budget_secs", 55)?
            .set_default("processor_retry_window_secs", 3600)?
            .set_default("prune_interval_secs", 3600)?
            .set_default("prune_batch_size", 500)?
            .set_default("prune_batch_pause_ms", 50)?;

        if config_path.exists() {
            builder = builder.add_source(File::from(config_path));
        }

        builder = builder.add_source(Environment::with_prefix("HEARTHMAP"));

        let config = builder.build()?;
        let app_config: AppConfig = config.try_deserialize()?;
        Ok(app_config)
    }
}
