use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

fn default_max_connections() -> u32 { 5 }
fn default_acquire_timeout() -> u64 { 3 }

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    #[serde(default = "default_topic")]
    pub topic: String,
}

fn default_topic() -> String { "order-notifications".to_string() }

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    /// Upper bound on waiting for an availability row lock.
    pub lock_timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { lock_timeout_ms: 2000 }
    }
}

impl LedgerConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MaintenanceConfig {
    pub cart_retention_hours: i64,
    pub idempotency_retention_hours: i64,
    pub sweep_interval_secs: u64,
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            cart_retention_hours: 24,
            idempotency_retention_hours: 48,
            sweep_interval_secs: 3600,
            dry_run: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotificationBackend {
    #[default]
    Log,
    Kafka,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct NotificationConfig {
    #[serde(default)]
    pub backend: NotificationBackend,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // per-environment overrides, e.g. config/production.toml
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // developer overrides, not checked in
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(environment())
            .build()?;

        s.try_deserialize()
    }
}

/// `VOYAGE__DATABASE__URL` sets `database.url`.
fn environment() -> config::Environment {
    config::Environment::with_prefix("VOYAGE")
        .prefix_separator("__")
        .separator("__")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_sections_fall_back_to_defaults() {
        let raw = config::Config::builder()
            .set_override("database.url", "postgres://localhost/voyage")
            .unwrap()
            .set_override("kafka.brokers", "localhost:9092")
            .unwrap()
            .build()
            .unwrap();

        let cfg: Config = raw.try_deserialize().unwrap();

        assert_eq!(cfg.database.max_connections, 5);
        assert_eq!(cfg.kafka.topic, "order-notifications");
        assert_eq!(cfg.ledger.lock_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.maintenance.cart_retention_hours, 24);
        assert_eq!(cfg.maintenance.idempotency_retention_hours, 48);
        assert_eq!(cfg.notifications.backend, NotificationBackend::Log);
    }

    #[test]
    fn test_environment_variables_use_double_underscores() {
        let vars: config::Map<String, String> = [
            ("VOYAGE__DATABASE__URL", "postgres://db/voyage"),
            ("VOYAGE__KAFKA__BROKERS", "kafka:9092"),
            ("VOYAGE_KAFKA__TOPIC", "ignored"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let raw = config::Config::builder()
            .add_source(environment().source(Some(vars)))
            .build()
            .unwrap();
        let cfg: Config = raw.try_deserialize().unwrap();

        assert_eq!(cfg.database.url, "postgres://db/voyage");
        assert_eq!(cfg.kafka.brokers, "kafka:9092");
        assert_eq!(cfg.kafka.topic, "order-notifications");
    }
}
