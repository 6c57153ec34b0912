//! Process-environment configuration for the edge agent.
//!
//! Unlike the YAML-file configuration some sibling drivers use, this agent is
//! configured purely from the process environment: every required key must
//! be present or startup aborts with a configuration error.

use crate::error::{EdgeError, Result};
use serde::{Deserialize, Serialize};
use std::env;

/// MQTT message-bus connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub group_id: String,
    pub keep_alive_secs: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl MqttConfig {
    /// The topic this agent subscribes to for inbound updates.
    pub fn updates_topic(&self) -> String {
        format!("lanzone/{}/updates", self.group_id)
    }

    /// The topic this agent publishes to when replying to a ping.
    pub fn pong_topic(&self) -> String {
        format!("lanzone/{}/pong", self.group_id)
    }

    fn validate(&self) -> Result<()> {
        if self.broker_host.trim().is_empty() {
            return Err(EdgeError::validation("MQTT_BROKER_HOST", "must not be empty"));
        }
        if self.broker_port == 0 {
            return Err(EdgeError::validation("MQTT_BROKER_PORT", "must be nonzero"));
        }
        if self.group_id.trim().is_empty() {
            return Err(EdgeError::validation("group_id", "must not be empty"));
        }
        Ok(())
    }
}

/// Cloud backend HTTP settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub api_base_url: String,
    pub ingest_endpoint: String,
    pub health_endpoint: String,
    pub state_validation_endpoint: String,
    pub modbus_validation_endpoint: String,
    pub api_key: Option<String>,
    pub posting_interval_seconds: u64,
    pub alert_batch_interval_seconds: u64,
}

impl BackendConfig {
    fn validate(&self) -> Result<()> {
        if self.api_base_url.trim().is_empty() {
            return Err(EdgeError::validation("api_base_url", "must not be empty"));
        }
        if !self.api_base_url.starts_with("http://") && !self.api_base_url.starts_with("https://") {
            return Err(EdgeError::validation(
                "api_base_url",
                "must start with http:// or https://",
            ));
        }
        Ok(())
    }

    /// Full URL for posting telemetry batches.
    pub fn ingest_url(&self) -> String {
        format!("{}{}", self.api_base_url, self.ingest_endpoint)
    }

    /// Full URL for posting health alerts.
    pub fn health_url(&self) -> String {
        format!("{}{}", self.api_base_url, self.health_endpoint)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub console_output: bool,
    pub json_format: bool,
    pub log_dir: String,
    pub stdout_only: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console_output: true,
            json_format: false,
            log_dir: "/var/log/lanzone-edge-agent".to_string(),
            stdout_only: false,
        }
    }
}

/// Top-level agent configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub backend: BackendConfig,
    pub logging: LoggingConfig,
    pub register_map_path: String,
    pub poll_interval_ms: u64,
    pub health_poll_hz: f64,
    pub timezone: String,
    pub fallback_max_days: i64,
    pub edge_pi_ip: Option<String>,
}

impl Config {
    /// Load configuration from the process environment, applying documented
    /// defaults for optional keys. Required keys missing from the
    /// environment abort loading with a configuration error.
    pub fn from_env() -> Result<Self> {
        let mqtt = MqttConfig {
            broker_host: require_env("MQTT_BROKER_HOST")?,
            broker_port: require_env("MQTT_BROKER_PORT")?.parse().map_err(|_| {
                EdgeError::config("MQTT_BROKER_PORT must be a valid port number")
            })?,
            group_id: require_env("group_id")?,
            keep_alive_secs: require_env("KEEP_ALIVE")?
                .parse()
                .map_err(|_| EdgeError::config("KEEP_ALIVE must be a valid integer"))?,
            username: optional_env("MQTT_USER"),
            password: optional_env("MQTT_PASSWORD"),
        };

        let backend = BackendConfig {
            api_base_url: require_env("api_base_url")?,
            ingest_endpoint: require_env("ingest_endpoint")?,
            health_endpoint: env::var("health_endpoint").unwrap_or_else(|_| "/blob/health".to_string()),
            state_validation_endpoint: require_env("state_validation_endpoint")?,
            modbus_validation_endpoint: require_env("modbus_validation_endpoint")?,
            api_key: optional_env("API_KEY"),
            posting_interval_seconds: env_or("POSTING_INTERVAL_SECONDS", 10),
            alert_batch_interval_seconds: env_or("ALERT_BATCH_INTERVAL_SECONDS", 45),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            console_output: true,
            json_format: env_flag("LOG_JSON"),
            log_dir: env::var("LOG_DIR").unwrap_or_else(|_| "/var/log/lanzone-edge-agent".to_string()),
            stdout_only: env_flag("LOG_TO_STDOUT"),
        };

        let config = Self {
            mqtt,
            backend,
            logging,
            register_map_path: env::var("REGISTER_MAP_PATH").unwrap_or_else(|_| "register_map.json".to_string()),
            poll_interval_ms: env_or("POLL_INTERVAL_MS", 1000),
            health_poll_hz: env::var("HEALTH_POLL_HZ")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1.0),
            timezone: env::var("TIMEZONE").unwrap_or_else(|_| "Europe/London".to_string()),
            fallback_max_days: env_or("FALLBACK_MAX_DAYS", 2),
            edge_pi_ip: optional_env("EDGE_PI_IP"),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.mqtt.validate()?;
        self.backend.validate()?;
        if self.poll_interval_ms == 0 {
            return Err(EdgeError::validation("POLL_INTERVAL_MS", "must be nonzero"));
        }
        if self.health_poll_hz <= 0.0 {
            return Err(EdgeError::validation("HEALTH_POLL_HZ", "must be positive"));
        }
        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(EdgeError::validation("TIMEZONE", "must be a valid IANA timezone"));
        }
        Ok(())
    }
}

fn require_env(key: &str) -> Result<String> {
    env::var(key).map_err(|_| EdgeError::config(format!("missing required environment variable: {key}")))
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    matches!(
        env::var(key).unwrap_or_default().to_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env vars are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn set_required_env() {
        unsafe {
            env::set_var("MQTT_BROKER_HOST", "broker.example.com");
            env::set_var("MQTT_BROKER_PORT", "8883");
            env::set_var("group_id", "lanzone-1");
            env::set_var("KEEP_ALIVE", "60");
            env::set_var("api_base_url", "https://api.example.com");
            env::set_var("ingest_endpoint", "/blob/ingest");
            env::set_var("state_validation_endpoint", "/edge/validate-state");
            env::set_var("modbus_validation_endpoint", "/edge/validate-modbus");
            env::set_var("MQTT_USER", "");
            env::set_var("MQTT_PASSWORD", "");
            env::set_var("API_KEY", "test-key");
        }
    }

    fn clear_env() {
        for key in [
            "MQTT_BROKER_HOST",
            "MQTT_BROKER_PORT",
            "group_id",
            "KEEP_ALIVE",
            "api_base_url",
            "ingest_endpoint",
            "state_validation_endpoint",
            "modbus_validation_endpoint",
            "MQTT_USER",
            "MQTT_PASSWORD",
            "API_KEY",
        ] {
            unsafe {
                env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_from_env_success() {
        let _guard = ENV_LOCK.lock().unwrap();
        set_required_env();
        let config = Config::from_env().unwrap();
        assert_eq!(config.mqtt.broker_host, "broker.example.com");
        assert_eq!(config.mqtt.updates_topic(), "lanzone/lanzone-1/updates");
        assert_eq!(config.backend.ingest_url(), "https://api.example.com/blob/ingest");
        clear_env();
    }

    #[test]
    fn test_from_env_missing_required() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        assert!(Config::from_env().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_url() {
        let _guard = ENV_LOCK.lock().unwrap();
        set_required_env();
        unsafe {
            env::set_var("api_base_url", "not-a-url");
        }
        assert!(Config::from_env().is_err());
        clear_env();
    }
}
