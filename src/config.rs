use std::path::Path;
use std::time::Duration;

use mac_address::MacAddress;
use reqwest::Url;
use serde_derive::Deserialize;
use thiserror::Error;

use crate::backoff::Backoff;
use crate::connection::ConnectionSettings;
use crate::radio::NameFilter;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("could not parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub device: DeviceConfig,
    #[serde(default)]
    pub webhooks: Vec<String>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    pub mqtt: Option<MqttConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DeviceConfig {
    /// Advertised local name of the die, e.g. "Galaxy".
    pub name: String,
    pub address: Option<MacAddress>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    pub bind: Option<String>,
    pub http_port: Option<u16>,
    pub websocket_port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: None,
            http_port: Some(8080),
            websocket_port: Some(8081),
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct StorageConfig {
    pub path: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct RetryConfig {
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub jitter: Option<f64>,
    /// Unset means retry forever.
    pub max_retries: Option<u32>,
    pub reset_after_seconds: Option<u64>,
    pub step_timeout_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct HubConfig {
    pub queue_capacity: Option<usize>,
    pub frame_queue: Option<usize>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct WebhookConfig {
    pub timeout_seconds: Option<u64>,
    pub attempts: Option<u32>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: AppConfig = toml::de::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.name.trim().is_empty() {
            return Err(ConfigError::Invalid("device.name must not be empty".into()));
        }

        let http_port = self.http_port();
        let websocket_port = self.websocket_port();
        if http_port == 0 || websocket_port == 0 {
            return Err(ConfigError::Invalid("server ports must be non-zero".into()));
        }
        if http_port == websocket_port {
            return Err(ConfigError::Invalid(format!(
                "http_port and websocket_port are both {http_port}"
            )));
        }

        self.webhook_urls()?;

        if self.queue_capacity() == 0 || self.frame_queue() == 0 {
            return Err(ConfigError::Invalid("hub queue sizes must be non-zero".into()));
        }

        let backoff = self.backoff();
        if !(0.0..=1.0).contains(&backoff.jitter) {
            return Err(ConfigError::Invalid(format!(
                "retry.jitter must be within 0..=1, got {}",
                backoff.jitter
            )));
        }
        if backoff.base > backoff.max {
            return Err(ConfigError::Invalid(
                "retry.base_delay_ms exceeds retry.max_delay_ms".into(),
            ));
        }
        if self.webhook.attempts == Some(0) {
            return Err(ConfigError::Invalid("webhook.attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn name_filter(&self) -> NameFilter {
        NameFilter {
            name: self.device.name.clone(),
            address: self.device.address,
        }
    }

    pub fn webhook_urls(&self) -> Result<Vec<Url>, ConfigError> {
        self.webhooks
            .iter()
            .map(|raw| {
                Url::parse(raw)
                    .map_err(|err| ConfigError::Invalid(format!("webhook {raw:?}: {err}")))
            })
            .collect()
    }

    pub fn bind_host(&self) -> &str {
        self.server.bind.as_deref().unwrap_or("0.0.0.0")
    }

    pub fn http_port(&self) -> u16 {
        self.server.http_port.unwrap_or(8080)
    }

    pub fn websocket_port(&self) -> u16 {
        self.server.websocket_port.unwrap_or(8081)
    }

    pub fn database_path(&self) -> &str {
        self.storage.path.as_deref().unwrap_or("pixels.db")
    }

    pub fn queue_capacity(&self) -> usize {
        self.hub.queue_capacity.unwrap_or(64)
    }

    pub fn frame_queue(&self) -> usize {
        self.hub.frame_queue.unwrap_or(32)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            base: Duration::from_millis(self.retry.base_delay_ms.unwrap_or(1_000)),
            max: Duration::from_millis(self.retry.max_delay_ms.unwrap_or(30_000)),
            jitter: self.retry.jitter.unwrap_or(0.2),
        }
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            backoff: self.backoff(),
            max_retries: self.retry.max_retries,
            reset_after: Duration::from_secs(self.retry.reset_after_seconds.unwrap_or(30)),
            step_timeout: Duration::from_secs(self.retry.step_timeout_seconds.unwrap_or(15)),
            frame_queue: self.frame_queue(),
            ..ConnectionSettings::default()
        }
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook.timeout_seconds.unwrap_or(5))
    }

    pub fn webhook_attempts(&self) -> u32 {
        self.webhook.attempts.unwrap_or(2)
    }
}
