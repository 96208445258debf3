use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::source::{PartitionId, StartPosition};

/// Environment variable holding a YAML tuning document.
pub const CONFIG_ENV_VAR: &str = "POLLER_CONFIG";

/// Largest batch a single receive may ask for.
pub const MAX_BATCH_SIZE: usize = 10_000;

/// Consumer group used when none is configured.
pub const DEFAULT_CONSUMER_GROUP: &str = "$Default";

const DEFAULT_ENDPOINT_SUFFIX: &str = "servicebus.windows.net";
const KAFKA_ENDPOINT_PORT: u16 = 9093;

/// Everything the console consumer needs, assembled once at startup.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub resource: StreamResource,
    pub polling: PollingConfig,
    pub retry: RetryConfig,
    pub kafka: KafkaOptions,
}

/// Identity and credentials of the partitioned stream to consume.
#[derive(Clone, Deserialize, Serialize)]
pub struct StreamResource {
    pub namespace: String,
    pub name: String,
    pub key_name: String,
    pub token: String,
    #[serde(default = "default_endpoint_suffix")]
    pub endpoint_suffix: String,
}

/// Optional knobs, loaded from YAML. Credentials never live here.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TuningConfig {
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub kafka: KafkaOptions,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PollingConfig {
    pub batch_size: usize,
    pub consumer_group: String,
    pub start_position: StartPosition,
    /// How long a single receive waits for the first record of a batch.
    pub receive_timeout_ms: u64,
    /// Restrict consumption to these partitions instead of all of them.
    pub partitions: Option<Vec<i32>>,
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries allowed after consecutive failed receives before a partition gives up.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

/// Transport settings for the Kafka protocol client.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KafkaOptions {
    /// Talk to these brokers instead of the namespace's event hub endpoint.
    pub bootstrap_servers: Option<String>,
    pub security_protocol: Option<String>,
    pub sasl_mechanisms: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
    pub session_timeout_ms: Option<u32>,
    pub metadata_timeout_ms: u64,
}

fn default_endpoint_suffix() -> String {
    DEFAULT_ENDPOINT_SUFFIX.to_string()
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            start_position: StartPosition::StartOfStream,
            receive_timeout_ms: 1000,
            partitions: None,
            shutdown_grace_ms: 5000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

impl Default for KafkaOptions {
    fn default() -> Self {
        Self {
            bootstrap_servers: None,
            security_protocol: None,
            sasl_mechanisms: None,
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
            session_timeout_ms: None,
            metadata_timeout_ms: 10_000,
        }
    }
}

impl StreamResource {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        key_name: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            key_name: key_name.into(),
            token: token.into(),
            endpoint_suffix: default_endpoint_suffix(),
        }
    }

    pub fn host(&self) -> String {
        format!("{}.{}", self.namespace, self.endpoint_suffix)
    }

    /// Shared access signature connection string for the resource.
    pub fn connection_string(&self) -> String {
        format!(
            "Endpoint=sb://{}/;SharedAccessKeyName={};SharedAccessKey={};EntityPath={}",
            self.host(),
            self.key_name,
            self.token,
            self.name
        )
    }

    /// Kafka protocol endpoint exposed by the namespace.
    pub fn kafka_endpoint(&self) -> String {
        format!("{}:{}", self.host(), KAFKA_ENDPOINT_PORT)
    }
}

impl fmt::Debug for StreamResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamResource")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("key_name", &self.key_name)
            .field("token", &"<redacted>")
            .field("endpoint_suffix", &self.endpoint_suffix)
            .finish()
    }
}

impl PollingConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn partition_filter(&self) -> Option<Vec<PartitionId>> {
        self.partitions
            .as_ref()
            .map(|ids| ids.iter().copied().map(PartitionId).collect())
    }
}

impl TuningConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            origin: path.to_string(),
            error: Box::new(e),
        })?;
        let config: TuningConfig =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::LoadFailed {
                origin: path.to_string(),
                error: Box::new(e),
            })?;
        Ok(config)
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let config_str = std::env::var(CONFIG_ENV_VAR)
            .map_err(|_| anyhow::anyhow!("{CONFIG_ENV_VAR} environment variable not set"))?;
        Self::from_yaml_str(&config_str)
    }

    pub fn from_yaml_str(content: &str) -> anyhow::Result<Self> {
        let config: TuningConfig = serde_yaml::from_str(content)?;
        Ok(config)
    }
}

/// Picks the tuning source: an explicit file wins, then the environment, then
/// built-in defaults.
pub fn load_tuning(config_path: Option<&str>) -> anyhow::Result<TuningConfig> {
    match config_path {
        Some(path) => TuningConfig::from_file(path),
        None if std::env::var_os(CONFIG_ENV_VAR).is_some() => TuningConfig::from_env(),
        None => Ok(TuningConfig::default()),
    }
}

impl ConsumerConfig {
    pub fn new(resource: StreamResource, tuning: TuningConfig) -> Self {
        Self {
            resource,
            polling: tuning.polling,
            retry: tuning.retry,
            kafka: tuning.kafka,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("namespace", &self.resource.namespace),
            ("ehname", &self.resource.name),
            ("key", &self.resource.key_name),
            ("token", &self.resource.token),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField {
                    field: field.to_string(),
                });
            }
        }

        if self.resource.endpoint_suffix.trim().is_empty() {
            return Err(invalid("endpoint suffix cannot be empty"));
        }
        if self.polling.batch_size == 0 {
            return Err(invalid("batch size must be positive"));
        }
        if self.polling.batch_size > MAX_BATCH_SIZE {
            return Err(invalid(&format!(
                "batch size {} exceeds the maximum of {MAX_BATCH_SIZE}",
                self.polling.batch_size
            )));
        }
        if self.polling.consumer_group.trim().is_empty() {
            return Err(invalid("consumer group cannot be empty"));
        }
        if self.polling.receive_timeout_ms == 0 {
            return Err(invalid("receive timeout must be positive"));
        }
        if let Some(partitions) = &self.polling.partitions {
            if partitions.is_empty() {
                return Err(invalid("partition list cannot be empty when given"));
            }
            if let Some(negative) = partitions.iter().find(|id| **id < 0) {
                return Err(invalid(&format!("partition id {negative} is negative")));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry max attempts must be at least 1"));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(invalid("retry multiplier must be at least 1.0"));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(invalid("retry initial delay cannot exceed the max delay"));
        }
        if let Some(servers) = &self.kafka.bootstrap_servers {
            if servers.trim().is_empty() {
                return Err(invalid("Kafka bootstrap servers cannot be empty"));
            }
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> ConfigError {
    ConfigError::ValidationFailed {
        reason: reason.to_string(),
    }
}
