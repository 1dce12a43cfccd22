use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SyncConfig {
    pub server: ServerConf,
    #[serde(default)]
    pub reconnect: ReconnectConf,
    #[serde(default)]
    pub retention: RetentionConf,
    #[serde(default)]
    pub seed: SeedConf,
    #[serde(default)]
    pub history: HistoryConf,
    #[serde(default)]
    pub series: SeriesConf,
    #[serde(default)]
    pub health: HealthConf,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ServerConf {
    pub endpoint: String,           // ex: "wss://fleet.example.com/api/ws/servers"
    #[serde(default)]
    pub public_endpoint: Option<String>,
    pub history_base_url: String,   // ex: "https://fleet.example.com"
}

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ReconnectConf {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Reconnect attempts after the first failure before giving up for good.
    pub max_retries: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RetentionConf {
    pub metrics_secs: u64,
    pub latency_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SeedConf {
    pub max_points: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct HistoryConf {
    /// No bound unless set: the transport's own timeouts apply.
    pub request_timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SeriesConf {
    pub preserve_data_on_fetch: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HealthConf {
    pub report_interval_secs: u64,
}

impl Default for ServerConf {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:8080/api/ws/servers".into(),
            public_endpoint: Some("ws://localhost:8080/api/ws/public".into()),
            history_base_url: "http://localhost:8080".into(),
        }
    }
}

impl Default for ReconnectConf {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            max_retries: 5,
        }
    }
}

impl ReconnectConf {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

impl Default for RetentionConf {
    fn default() -> Self {
        Self {
            metrics_secs: 600,
            latency_secs: 300,
        }
    }
}

impl Default for SeedConf {
    fn default() -> Self {
        Self { max_points: 600 }
    }
}

impl HistoryConf {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for SeriesConf {
    fn default() -> Self {
        Self {
            preserve_data_on_fetch: true,
        }
    }
}

impl Default for HealthConf {
    fn default() -> Self {
        Self {
            report_interval_secs: 30,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server: ServerConf::default(),
            reconnect: ReconnectConf::default(),
            retention: RetentionConf::default(),
            seed: SeedConf::default(),
            history: HistoryConf::default(),
            series: SeriesConf::default(),
            health: HealthConf::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_yaml_str(txt: &str) -> Result<Self, ConfigError> {
        let cfg: SyncConfig = serde_yaml::from_str(txt)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let txt = fs::read_to_string(path).await?;
        Self::from_yaml_str(&txt)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "server.endpoint",
                reason: "must not be empty".into(),
            });
        }
        if !(self.reconnect.multiplier >= 1.0) {
            return Err(ConfigError::Invalid {
                field: "reconnect.multiplier",
                reason: format!("{} is below 1.0", self.reconnect.multiplier),
            });
        }
        if self.retention.metrics_secs == 0 || self.retention.latency_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "retention",
                reason: "windows must be at least one second".into(),
            });
        }
        Ok(())
    }

    /// Environment wins over the file for endpoints.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(endpoint) = std::env::var("FLEET_SYNC_ENDPOINT") {
            self.server.endpoint = endpoint;
        }
        if let Ok(public) = std::env::var("FLEET_SYNC_PUBLIC_ENDPOINT") {
            self.server.public_endpoint = if public.is_empty() { None } else { Some(public) };
        }
        if let Ok(url) = std::env::var("FLEET_SYNC_HISTORY_URL") {
            self.server.history_base_url = url;
        }
    }
}

pub async fn load_config() -> SyncConfig {
    let path = std::env::var("FLEET_SYNC_CONFIG").unwrap_or_else(|_| "fleet-sync.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            SyncConfig::default()
        } else {
            SyncConfig::from_yaml_str(&txt).unwrap_or_else(|e| {
                warn!("config {path} invalide: {e}");
                SyncConfig::default()
            })
        }
    } else {
        warn!("pas de {path}, usage config par défaut");
        SyncConfig::default()
    };
    cfg.apply_env_overrides();
    cfg
}
