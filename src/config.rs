use anyhow::{Context, Result};
use ipnet::IpNet;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub pipeline: PipelineConfig,
    pub policy: PolicyConfig,
    pub executor: ExecutorConfig,
    pub reward: RewardConfig,
    pub safety: SafetyConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Observe-only mode forces every final action to `log_only`.
    pub observe_only: bool,
    /// Save the policy checkpoint after this many requests.
    pub checkpoint_interval: u64,
    pub checkpoint_path: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            observe_only: true,
            checkpoint_interval: 100,
            checkpoint_path: "rl_policy_checkpoint.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub exploration_rate: f64,
    pub learning_rate: f64,
    pub default_value: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            exploration_rate: 0.1,
            learning_rate: 0.05,
            default_value: 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutorConfig {
    #[serde(with = "duration_serde")]
    pub throttle_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            throttle_delay: Duration::from_millis(500),
        }
    }
}

/// Reward weights. Penalties are expressed as negative numbers.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RewardConfig {
    pub attack_blocked_reward: f64,
    pub legitimate_allowed_reward: f64,
    pub false_positive_penalty: f64,
    pub false_negative_penalty: f64,
    pub sanitize_attack_factor: f64,
    pub sanitize_legitimate_factor: f64,
    pub throttle_attack_factor: f64,
    pub throttle_legitimate_factor: f64,
    pub latency_threshold_ms: f64,
    pub max_latency_penalty: f64,
    pub downstream_error_penalty: f64,
    pub user_complaint_penalty: f64,
    pub efficiency_bonus: f64,
    pub server_error_penalty: f64,
    pub client_error_penalty: f64,
    pub attack_probability_threshold: f64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            attack_blocked_reward: 1.0,
            legitimate_allowed_reward: 0.5,
            false_positive_penalty: -2.0,
            false_negative_penalty: -1.5,
            sanitize_attack_factor: 0.7,
            sanitize_legitimate_factor: 0.8,
            throttle_attack_factor: 0.5,
            throttle_legitimate_factor: 0.6,
            latency_threshold_ms: 1000.0,
            max_latency_penalty: -0.5,
            downstream_error_penalty: -0.5,
            user_complaint_penalty: -1.0,
            efficiency_bonus: 0.2,
            server_error_penalty: -0.3,
            client_error_penalty: -0.1,
            attack_probability_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Regexes added to the built-in protected endpoint list.
    pub protected_endpoints: Vec<String>,
    /// CIDR ranges added to the built-in internal network list.
    pub internal_networks: Vec<String>,
    /// Exact paths that are always allowed.
    pub health_paths: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            protected_endpoints: Vec::new(),
            internal_networks: Vec::new(),
            health_paths: vec!["/health".to_string(), "/ping".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub audit_log: AuditLogConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            audit_log: AuditLogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuditLogConfig {
    pub enabled: bool,
    pub output: String,
}

impl Default for AuditLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output: "logs/decisions.jsonl".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
            path: "/metrics".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be zero");
        }

        if self.pipeline.checkpoint_interval == 0 {
            anyhow::bail!("Checkpoint interval cannot be zero");
        }
        if self.pipeline.checkpoint_path.is_empty() {
            anyhow::bail!("Checkpoint path cannot be empty");
        }

        let policy = &self.policy;
        if !(0.0..=1.0).contains(&policy.exploration_rate) {
            anyhow::bail!("Exploration rate must be within [0, 1], got {}", policy.exploration_rate);
        }
        if !(0.0..=1.0).contains(&policy.learning_rate) {
            anyhow::bail!("Learning rate must be within [0, 1], got {}", policy.learning_rate);
        }
        if !policy.default_value.is_finite() {
            anyhow::bail!("Default value must be finite");
        }

        self.reward.validate()?;

        for pattern in &self.safety.protected_endpoints {
            Regex::new(pattern)
                .with_context(|| format!("Invalid protected endpoint pattern: {}", pattern))?;
        }
        for network in &self.safety.internal_networks {
            network
                .parse::<IpNet>()
                .with_context(|| format!("Invalid internal network: {}", network))?;
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!("Unknown log format: {}", self.logging.format);
        }
        if self.logging.audit_log.enabled && self.logging.audit_log.output.is_empty() {
            anyhow::bail!("Audit log output cannot be empty when the audit log is enabled");
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            anyhow::bail!("Metrics port cannot be zero when metrics are enabled");
        }

        Ok(())
    }
}

impl RewardConfig {
    pub fn validate(&self) -> Result<()> {
        let penalties = [
            ("false_positive_penalty", self.false_positive_penalty),
            ("false_negative_penalty", self.false_negative_penalty),
            ("max_latency_penalty", self.max_latency_penalty),
            ("downstream_error_penalty", self.downstream_error_penalty),
            ("user_complaint_penalty", self.user_complaint_penalty),
            ("server_error_penalty", self.server_error_penalty),
            ("client_error_penalty", self.client_error_penalty),
        ];
        for (name, value) in penalties {
            if !value.is_finite() || value > 0.0 {
                anyhow::bail!("Reward weight {} must be a finite value <= 0, got {}", name, value);
            }
        }

        if !(self.latency_threshold_ms.is_finite() && self.latency_threshold_ms > 0.0) {
            anyhow::bail!("Latency threshold must be positive, got {}", self.latency_threshold_ms);
        }
        if !(0.0..=1.0).contains(&self.attack_probability_threshold) {
            anyhow::bail!(
                "Attack probability threshold must be within [0, 1], got {}",
                self.attack_probability_threshold
            );
        }

        let others = [
            self.attack_blocked_reward,
            self.legitimate_allowed_reward,
            self.sanitize_attack_factor,
            self.sanitize_legitimate_factor,
            self.throttle_attack_factor,
            self.throttle_legitimate_factor,
            self.efficiency_bonus,
        ];
        if others.iter().any(|v| !v.is_finite()) {
            anyhow::bail!("Reward weights must be finite");
        }

        Ok(())
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse_duration(
        s: &str,
    ) -> std::result::Result<Duration, Box<dyn std::error::Error + Send + Sync>> {
        let s = s.trim();
        if let Some(num) = s.strip_suffix("ms") {
            Ok(Duration::from_millis(num.trim().parse()?))
        } else if let Some(num) = s.strip_suffix('s') {
            Ok(Duration::from_secs(num.trim().parse()?))
        } else if let Some(num) = s.strip_suffix('m') {
            let num: u64 = num.trim().parse()?;
            Ok(Duration::from_secs(num * 60))
        } else if let Some(num) = s.strip_suffix('h') {
            let num: u64 = num.trim().parse()?;
            Ok(Duration::from_secs(num * 3600))
        } else {
            Ok(Duration::from_secs(s.parse()?))
        }
    }
}
