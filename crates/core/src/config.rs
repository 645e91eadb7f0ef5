use serde::Deserialize;

/// Root application configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `NURTURE__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_parallel_ticks")]
    pub max_parallel_ticks: usize,
    /// How long a claimed execution stays invisible to other sweeps.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// Contacts pulled per chunk while streaming a filtered bulk enrollment.
    #[serde(default = "default_enrollment_chunk_size")]
    pub enrollment_chunk_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_secs")]
    pub initial_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentConfig {
    #[serde(default = "default_content_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub slack_webhook_url: Option<String>,
    #[serde(default)]
    pub discord_webhook_url: Option<String>,
    #[serde(default)]
    pub team_email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_host")]
    pub host: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_sweep_interval_ms() -> u64 {
    60_000
}
fn default_batch_size() -> usize {
    1000
}
fn default_max_parallel_ticks() -> usize {
    32
}
fn default_lease_secs() -> u64 {
    300
}
fn default_enrollment_chunk_size() -> usize {
    500
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_secs() -> u64 {
    60
}
fn default_max_backoff_secs() -> u64 {
    3600
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_webhook_timeout_ms() -> u64 {
    10_000
}
fn default_content_timeout_ms() -> u64 {
    30_000
}
fn default_metrics_host() -> String {
    "0.0.0.0".to_string()
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval_ms(),
            batch_size: default_batch_size(),
            max_parallel_ticks: default_max_parallel_ticks(),
            lease_secs: default_lease_secs(),
            enrollment_chunk_size: default_enrollment_chunk_size(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_secs: default_initial_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (1-based), capped at `max_backoff_secs`.
    pub fn backoff_secs(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.initial_backoff_secs as f64 * self.multiplier.max(1.0).powi(exp);
        (raw as u64).min(self.max_backoff_secs)
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_webhook_timeout_ms(),
        }
    }
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_content_timeout_ms(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            host: default_metrics_host(),
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            scheduler: SchedulerConfig::default(),
            retry: RetryConfig::default(),
            webhook: WebhookConfig::default(),
            content: ContentConfig::default(),
            notify: NotifyConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and an optional config file.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("NURTURE")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
