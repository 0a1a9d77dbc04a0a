//! Configuration management for the throttling controller
//!
//! Handles:
//! - MQTT broker and stream subscription settings
//! - Consumer pool sizing and retry backoff
//! - Policy thresholds, sampler backend, control cadence
//! - Optional status publishing
//!
//! Every field has a default, so an empty file (or no file at all) reproduces
//! the stock setup: 3 consumers, 50% throttle / 70% pause, 5 s ticks.

use crate::aggregate::{AggregationStrategy, SignalSource, UtilizationAggregator};
use crate::consumer::ConsumerSettings;
use crate::control::{ControlSettings, ProbeFailurePolicy};
use crate::error::ConfigError;
use crate::policy::ThrottlePolicy;
use crate::sampler::DEFAULT_PROBE_COMMAND;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "SYMBION_THROTTLE_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub broker: BrokerConfig,
    pub stream: StreamConfig,
    pub consumers: ConsumersConfig,
    pub policy: PolicyConfig,
    pub sampler: SamplerConfig,
    pub aggregation: AggregationConfig,
    pub control: ControlConfig,
    pub status: StatusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
    pub clean_session: bool,
    /// Client ids are `{prefix}-{hostname}-{consumer id}`
    pub client_id_prefix: String,
    pub reconnect_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub topic: String,
    /// Consumer group, mapped to an MQTT shared subscription
    pub group: Option<String>,
    pub qos: u8,
    pub inbox_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumersConfig {
    pub count: u32,
    pub base_poll_interval_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub throttle_threshold: f64,
    pub pause_threshold: f64,
    pub throttle_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SamplerBackend {
    #[default]
    NvidiaSmi,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub backend: SamplerBackend,
    /// Probe command line for the `nvidia-smi` backend
    pub command: String,
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub strategy: AggregationStrategy,
    pub source: SignalSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub tick_interval_ms: u64,
    pub on_probe_failure: ProbeFailurePolicy,
    /// Consecutive failed ticks before the fallback decision applies
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    pub topic: String,
    pub interval_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            keep_alive_secs: 30,
            clean_session: true,
            client_id_prefix: "symbion-throttle".to_string(),
            reconnect_delay_secs: 2,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            topic: "symbion/jobs@v1".to_string(),
            group: Some("test_group".to_string()),
            qos: 1,
            inbox_capacity: 64,
        }
    }
}

impl Default for ConsumersConfig {
    fn default() -> Self {
        Self {
            count: 3,
            base_poll_interval_ms: 100,
            backoff_initial_ms: 100,
            backoff_max_ms: 5_000,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            throttle_threshold: 50.0,
            pause_threshold: 70.0,
            throttle_interval_ms: 60_000,
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            backend: SamplerBackend::NvidiaSmi,
            command: DEFAULT_PROBE_COMMAND.to_string(),
            probe_timeout_ms: 3_000,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 5_000,
            on_probe_failure: ProbeFailurePolicy::Throttle,
            failure_threshold: 3,
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            topic: "symbion/throttle/status@v1".to_string(),
            interval_secs: 30,
        }
    }
}

impl ThrottleConfig {
    /// Load config from an explicit path, the env var, or the OS config dir.
    /// A missing file yields defaults; a broken one is an error.
    pub async fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => path,
            None => match std::env::var_os(CONFIG_ENV) {
                Some(path) => PathBuf::from(path),
                None => Self::config_file_path()?,
            },
        };

        if !path.exists() {
            tracing::warn!("No config at {:?}, using defaults", path);
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
        Self::from_toml(&content, &path)
    }

    /// Parse and validate TOML text; `origin` is only used in error messages
    pub fn from_toml(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: ThrottleConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf, ConfigError> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| ConfigError::Invalid("could not find config directory".to_string()))?;

        path.push("symbion-throttle");
        path.push("config.toml");
        Ok(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.consumers.count == 0 {
            return invalid("consumers.count must be at least 1");
        }
        if self.consumers.base_poll_interval_ms == 0 {
            return invalid("consumers.base_poll_interval_ms must be greater than zero");
        }
        if self.policy.throttle_interval_ms <= self.consumers.base_poll_interval_ms {
            return invalid("policy.throttle_interval_ms must exceed consumers.base_poll_interval_ms");
        }
        if self.consumers.backoff_initial_ms == 0 {
            return invalid("consumers.backoff_initial_ms must be greater than zero");
        }
        if self.consumers.backoff_initial_ms > self.consumers.backoff_max_ms {
            return invalid("consumers.backoff_initial_ms exceeds consumers.backoff_max_ms");
        }
        if self.stream.topic.trim().is_empty() {
            return invalid("stream.topic is empty");
        }
        if self.stream.qos > 2 {
            return invalid("stream.qos must be 0, 1 or 2");
        }
        if self.stream.inbox_capacity == 0 {
            return invalid("stream.inbox_capacity must be greater than zero");
        }
        if self.sampler.probe_timeout_ms == 0 {
            return invalid("sampler.probe_timeout_ms must be greater than zero");
        }
        if self.sampler.backend == SamplerBackend::NvidiaSmi && self.sampler.command.trim().is_empty() {
            return invalid("sampler.command is empty");
        }
        if self.control.tick_interval_ms == 0 {
            return invalid("control.tick_interval_ms must be greater than zero");
        }
        if self.control.failure_threshold == 0 {
            return invalid("control.failure_threshold must be at least 1");
        }
        if self.status.enabled && self.status.interval_secs == 0 {
            return invalid("status.interval_secs must be greater than zero");
        }

        self.throttle_policy()?;
        Ok(())
    }

    pub fn throttle_policy(&self) -> Result<ThrottlePolicy, ConfigError> {
        Ok(ThrottlePolicy::new(
            self.policy.throttle_threshold,
            self.policy.pause_threshold,
            Duration::from_millis(self.policy.throttle_interval_ms),
        )?)
    }

    pub fn aggregator(&self) -> UtilizationAggregator {
        UtilizationAggregator::new(self.aggregation.strategy, self.aggregation.source)
    }

    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            base_poll_interval: Duration::from_millis(self.consumers.base_poll_interval_ms),
            backoff_initial: Duration::from_millis(self.consumers.backoff_initial_ms),
            backoff_max: Duration::from_millis(self.consumers.backoff_max_ms),
        }
    }

    pub fn control_settings(&self) -> ControlSettings {
        ControlSettings {
            tick_interval: Duration::from_millis(self.control.tick_interval_ms),
            probe_timeout: Duration::from_millis(self.sampler.probe_timeout_ms),
            on_probe_failure: self.control.on_probe_failure,
            failure_threshold: self.control.failure_threshold,
        }
    }

    /// Topic consumers subscribe to, as a shared subscription when grouped
    pub fn subscription_topic(&self) -> String {
        match &self.stream.group {
            Some(group) if !group.is_empty() => format!("$share/{}/{}", group, self.stream.topic),
            _ => self.stream.topic.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ThrottleConfig::default();
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.consumers.count, 3);
        assert_eq!(config.policy.throttle_threshold, 50.0);
        assert_eq!(config.policy.pause_threshold, 70.0);
        assert_eq!(config.sampler.backend, SamplerBackend::NvidiaSmi);
        assert_eq!(config.control.on_probe_failure, ProbeFailurePolicy::Throttle);
        assert!(config.validate().is_ok());
        assert_eq!(config.subscription_topic(), "$share/test_group/symbion/jobs@v1");
    }

    #[test]
    fn test_config_file_path() {
        let path = ThrottleConfig::config_file_path().unwrap();
        assert!(path.to_string_lossy().contains("symbion-throttle"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let toml = r#"
            [stream]
            topic = "inference/requests"
            group = ""

            [policy]
            throttle_threshold = 40.0
            pause_threshold = 90.0

            [sampler]
            backend = "system"

            [aggregation]
            strategy = "max"
            source = "occupied_capacity"

            [control]
            on_probe_failure = "hold"
        "#;
        let config = ThrottleConfig::from_toml(toml, Path::new("inline")).unwrap();
        assert_eq!(config.stream.topic, "inference/requests");
        assert_eq!(config.subscription_topic(), "inference/requests");
        assert_eq!(config.stream.qos, 1);
        assert_eq!(config.sampler.backend, SamplerBackend::System);
        assert_eq!(config.aggregation.strategy, AggregationStrategy::Max);
        assert_eq!(config.aggregation.source, SignalSource::OccupiedCapacity);
        assert_eq!(config.control.on_probe_failure, ProbeFailurePolicy::Hold);
        assert_eq!(config.consumers.count, 3);

        let policy = config.throttle_policy().unwrap();
        assert_eq!(policy.throttle_threshold(), 40.0);
        assert_eq!(policy.throttle_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_thresholds_are_fatal() {
        let toml = "[policy]\nthrottle_threshold = 80.0\npause_threshold = 70.0\n";
        assert!(matches!(
            ThrottleConfig::from_toml(toml, Path::new("inline")),
            Err(ConfigError::Policy(_))
        ));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cases = [
            "[consumers]\ncount = 0\n",
            "[consumers]\nbase_poll_interval_ms = 0\n",
            "[consumers]\nbackoff_initial_ms = 9000\nbackoff_max_ms = 1000\n",
            "[stream]\nqos = 3\n",
            "[stream]\ntopic = \" \"\n",
            "[control]\ntick_interval_ms = 0\n",
            "[control]\nfailure_threshold = 0\n",
            "[sampler]\ncommand = \"\"\n",
            "[policy]\nthrottle_interval_ms = 50\n",
            "[policy]\nthrottle_interval_ms = 100\n",
            "[consumers]\nbase_poll_interval_ms = 90000\n",
        ];
        for case in cases {
            assert!(
                matches!(ThrottleConfig::from_toml(case, Path::new("inline")), Err(ConfigError::Invalid(_))),
                "accepted: {case}"
            );
        }
    }

    #[test]
    fn test_unparseable_toml() {
        let err = ThrottleConfig::from_toml("[policy\n", Path::new("broken.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("broken.toml"));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[consumers]\ncount = 5\n[control]\ntick_interval_ms = 250").unwrap();

        let config = ThrottleConfig::load(Some(file.path().to_path_buf())).await.unwrap();
        assert_eq!(config.consumers.count, 5);
        assert_eq!(config.control_settings().tick_interval, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ThrottleConfig::load(Some(dir.path().join("absent.toml"))).await.unwrap();
        assert_eq!(config.consumers.count, 3);
    }
}
