use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `DAFFODIL__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default = "default_agents_per_node")]
    pub agents_per_node: usize,
    #[serde(default)]
    pub nats: NatsConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    #[serde(default = "default_nats_urls")]
    pub urls: Vec<String>,
    #[serde(default = "default_stream_name")]
    pub stream_name: String,
    #[serde(default = "default_queue_group")]
    pub queue_group: String,
    #[serde(default = "default_nats_max_reconnects")]
    pub max_reconnects: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_urls")]
    pub urls: Vec<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    #[serde(default = "default_clickhouse_url")]
    pub url: String,
    #[serde(default = "default_clickhouse_db")]
    pub database: String,
}

/// Knobs for the re-evaluation coordinator and cache materializer.
#[derive(Debug, Clone, Deserialize)]
pub struct EvaluationConfig {
    /// Upper bound on users evaluated concurrently during a batch sweep.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Interval between scheduled full sweeps. Zero disables the scheduler.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Deadline applied to every store read, catalog reload and cache write.
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_publish_max_attempts")]
    pub publish_max_attempts: u32,
    #[serde(default = "default_publish_backoff_base_ms")]
    pub publish_backoff_base_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_host")]
    pub host: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_node_id() -> String {
    "segmenter-01".to_string()
}
fn default_agents_per_node() -> usize {
    4
}
fn default_nats_urls() -> Vec<String> {
    vec!["nats://localhost:4222".to_string()]
}
fn default_stream_name() -> String {
    "daffodil".to_string()
}
fn default_queue_group() -> String {
    "segment-agents".to_string()
}
fn default_nats_max_reconnects() -> usize {
    10
}
fn default_redis_urls() -> Vec<String> {
    vec!["redis://localhost:6379".to_string()]
}
fn default_connect_timeout_ms() -> u64 {
    1000
}
fn default_clickhouse_url() -> String {
    "http://localhost:8123".to_string()
}
fn default_clickhouse_db() -> String {
    "daffodil".to_string()
}
fn default_max_concurrency() -> usize {
    16
}
fn default_sweep_interval_secs() -> u64 {
    300
}
fn default_operation_timeout_ms() -> u64 {
    2000
}
fn default_publish_max_attempts() -> u32 {
    3
}
fn default_publish_backoff_base_ms() -> u64 {
    50
}
fn default_metrics_host() -> String {
    "0.0.0.0".to_string()
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            urls: default_nats_urls(),
            stream_name: default_stream_name(),
            queue_group: default_queue_group(),
            max_reconnects: default_nats_max_reconnects(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            urls: default_redis_urls(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: default_clickhouse_url(),
            database: default_clickhouse_db(),
        }
    }
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            sweep_interval_secs: default_sweep_interval_secs(),
            operation_timeout_ms: default_operation_timeout_ms(),
            publish_max_attempts: default_publish_max_attempts(),
            publish_backoff_base_ms: default_publish_backoff_base_ms(),
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
            agents_per_node: default_agents_per_node(),
            nats: NatsConfig::default(),
            redis: RedisConfig::default(),
            clickhouse: ClickHouseConfig::default(),
            evaluation: EvaluationConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl EvaluationConfig {
    pub fn operation_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn publish_backoff_base(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.publish_backoff_base_ms)
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("DAFFODIL")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
