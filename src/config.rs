use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub db: DbConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Sent as the remote `full` flag (search beyond the last year).
    #[serde(default)]
    pub full_mode: bool,
    /// Most records the remote will return for one query.
    #[serde(default = "default_page_cap")]
    pub page_cap: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            full_mode: false,
            page_cap: default_page_cap(),
        }
    }
}

fn default_base_url() -> String {
    "https://fofa.info".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    1000
}
fn default_page_cap() -> u32 {
    10_000
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProxyConfig {
    #[serde(default)]
    pub pool: Vec<String>,
    #[serde(default)]
    pub fallback: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractConfig {
    #[serde(default = "default_page_cap")]
    pub page_size: u32,
    /// Categorical field the peeler splits on.
    #[serde(default = "default_dimension")]
    pub dimension: String,
    #[serde(default = "default_max_peel_rounds")]
    pub max_peel_rounds: u32,
    #[serde(default = "default_max_trace_rounds")]
    pub max_trace_rounds: u32,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_cap(),
            dimension: default_dimension(),
            max_peel_rounds: default_max_peel_rounds(),
            max_trace_rounds: default_max_trace_rounds(),
            output_dir: default_output_dir(),
        }
    }
}

fn default_dimension() -> String {
    "country".to_string()
}
fn default_max_peel_rounds() -> u32 {
    50
}
fn default_max_trace_rounds() -> u32 {
    1000
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("./data/results")
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_tasks_file")]
    pub tasks_file: PathBuf,
    #[serde(default = "default_monitor_page_size")]
    pub page_size: u32,
    #[serde(default = "default_initial_interval")]
    pub initial_interval_secs: u64,
    #[serde(default = "default_min_interval")]
    pub min_interval_secs: u64,
    #[serde(default = "default_max_interval")]
    pub max_interval_secs: u64,
    #[serde(default = "default_shrink_factor")]
    pub shrink_factor: f64,
    #[serde(default = "default_grow_factor")]
    pub grow_factor: f64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default = "default_notification_threshold")]
    pub notification_threshold: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            data_dir: default_monitor_dir(),
            tasks_file: default_tasks_file(),
            page_size: default_monitor_page_size(),
            initial_interval_secs: default_initial_interval(),
            min_interval_secs: default_min_interval(),
            max_interval_secs: default_max_interval(),
            shrink_factor: default_shrink_factor(),
            grow_factor: default_grow_factor(),
            jitter: default_jitter(),
            notification_threshold: default_notification_threshold(),
        }
    }
}

fn default_monitor_dir() -> PathBuf {
    PathBuf::from("./data/monitor")
}
fn default_tasks_file() -> PathBuf {
    PathBuf::from("./data/monitor/tasks.json")
}
fn default_monitor_page_size() -> u32 {
    5000
}
fn default_initial_interval() -> u64 {
    3600
}
fn default_min_interval() -> u64 {
    600
}
fn default_max_interval() -> u64 {
    43_200
}
fn default_shrink_factor() -> f64 {
    0.7
}
fn default_grow_factor() -> f64 {
    1.5
}
fn default_jitter() -> f64 {
    0.1
}
fn default_notification_threshold() -> u64 {
    5000
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/harvest.sqlite")
}

impl Config {
    /// All defaults, no keys.
    pub fn minimal() -> Self {
        Self::default()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate api
    if config.api.page_cap == 0 {
        anyhow::bail!("api.page_cap must be > 0");
    }

    // Validate extract
    if config.extract.page_size == 0 || config.extract.page_size > config.api.page_cap {
        anyhow::bail!(
            "extract.page_size must be in [1, {}] (api.page_cap)",
            config.api.page_cap
        );
    }
    if config.extract.max_peel_rounds < 1 {
        anyhow::bail!("extract.max_peel_rounds must be >= 1");
    }
    if config.extract.max_trace_rounds < 1 {
        anyhow::bail!("extract.max_trace_rounds must be >= 1");
    }
    if config.extract.dimension.trim().is_empty() {
        anyhow::bail!("extract.dimension must not be empty");
    }

    // Validate monitor
    let m = &config.monitor;
    if m.page_size == 0 || m.page_size > config.api.page_cap {
        anyhow::bail!(
            "monitor.page_size must be in [1, {}] (api.page_cap)",
            config.api.page_cap
        );
    }
    if m.min_interval_secs < 1 {
        anyhow::bail!("monitor.min_interval_secs must be >= 1");
    }
    if m.min_interval_secs > m.max_interval_secs {
        anyhow::bail!("monitor.min_interval_secs must be <= monitor.max_interval_secs");
    }
    if !(0.5..1.0).contains(&m.shrink_factor) {
        anyhow::bail!("monitor.shrink_factor must be in [0.5, 1.0)");
    }
    if !(m.grow_factor > 1.0 && m.grow_factor <= 2.0) {
        anyhow::bail!("monitor.grow_factor must be in (1.0, 2.0]");
    }
    if !(0.0..=0.5).contains(&m.jitter) {
        anyhow::bail!("monitor.jitter must be in [0.0, 0.5]");
    }
    if m.notification_threshold == 0 {
        anyhow::bail!("monitor.notification_threshold must be >= 1");
    }

    Ok(())
}
