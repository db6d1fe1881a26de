//! Runtime settings.
//!
//! Loaded from built-in defaults, an optional file, and `RESILIENCE__*`
//! environment variables, later sources winning:
//!
//! ```text
//! RESILIENCE__QUEUE__BACKEND=redis
//! RESILIENCE__QUEUE__REDIS_URL=redis://cache:6379/2
//! RESILIENCE__QUEUE__MAX_ATTEMPTS=5
//! RESILIENCE__HEALTH__SERVICES=database,payment,email
//! ```

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::SettingsError;
use crate::queue::{BackendKind, InProcessConfig, DEFAULT_MAX_ATTEMPTS};

const ENV_PREFIX: &str = "RESILIENCE";

/// Top-level settings for [`Resilience`](crate::Resilience).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Event queue.
    pub queue: QueueSettings,
    /// Health registry and monitor.
    pub health: HealthSettings,
}

/// Event queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Preferred backend. Redis falls back to in-process when unusable.
    pub backend: BackendKind,
    /// Redis connection URL; required for the Redis backend.
    pub redis_url: Option<String>,
    /// Namespace for Redis keys.
    pub key_prefix: String,
    /// Worker tick in milliseconds.
    pub poll_interval_ms: u64,
    /// Delivery attempts before dead-lettering.
    pub max_attempts: u32,
    /// Bound on the initial Redis connection in milliseconds.
    pub connect_timeout_ms: u64,
    /// How long a stopped Redis consumer's claims are kept before another
    /// instance returns them to the pending list, in milliseconds.
    pub claim_ttl_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::InProcess,
            redis_url: None,
            key_prefix: "resilience:events".to_string(),
            poll_interval_ms: 100,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            connect_timeout_ms: 5_000,
            claim_ttl_ms: 30_000,
        }
    }
}

impl QueueSettings {
    /// Worker tick.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Initial connection bound.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Lifetime of a Redis consumer's heartbeat.
    pub fn claim_ttl(&self) -> Duration {
        Duration::from_millis(self.claim_ttl_ms)
    }

    /// Settings for the in-process adapter.
    pub fn in_process(&self) -> InProcessConfig {
        InProcessConfig {
            poll_interval: self.poll_interval(),
        }
    }
}

/// Health registry and monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Services registered as healthy at startup.
    pub services: Vec<String>,
    /// Interval between health snapshots in milliseconds.
    pub snapshot_interval_ms: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            services: ["database", "payment", "email", "api"]
                .into_iter()
                .map(String::from)
                .collect(),
            snapshot_interval_ms: 30_000,
        }
    }
}

impl HealthSettings {
    /// Interval between health snapshots.
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }
}

impl Settings {
    /// Loads defaults overlaid with `RESILIENCE__*` environment variables.
    pub fn load() -> Result<Self, SettingsError> {
        Self::build(None)
    }

    /// Like [`load`](Self::load), with `path` layered between the defaults
    /// and the environment. A missing file is an error.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        Self::build(Some(path.as_ref()))
    }

    fn build(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        let settings: Settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("health.services")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Rejects values no component can run with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.queue.poll_interval_ms == 0 {
            return Err(SettingsError::Invalid(
                "queue.poll_interval_ms must be positive".into(),
            ));
        }
        if self.queue.max_attempts == 0 {
            return Err(SettingsError::Invalid(
                "queue.max_attempts must be at least 1".into(),
            ));
        }
        if self.queue.claim_ttl_ms == 0 {
            return Err(SettingsError::Invalid(
                "queue.claim_ttl_ms must be positive".into(),
            ));
        }
        if self.health.snapshot_interval_ms == 0 {
            return Err(SettingsError::Invalid(
                "health.snapshot_interval_ms must be positive".into(),
            ));
        }
        if self.queue.key_prefix.trim().is_empty() {
            return Err(SettingsError::Invalid("queue.key_prefix must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.queue.backend, BackendKind::InProcess);
        assert_eq!(settings.queue.poll_interval(), Duration::from_millis(100));
        assert_eq!(settings.queue.max_attempts, 3);
        assert_eq!(settings.queue.claim_ttl(), Duration::from_secs(30));
        assert_eq!(settings.health.services.len(), 4);
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let mut settings = Settings::default();
        settings.queue.poll_interval_ms = 0;
        assert!(matches!(settings.validate(), Err(SettingsError::Invalid(_))));

        let mut settings = Settings::default();
        settings.queue.claim_ttl_ms = 0;
        assert!(matches!(settings.validate(), Err(SettingsError::Invalid(_))));
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = std::env::temp_dir().join(format!("resilience-settings-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("resilience.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[queue]\nbackend = \"redis\"\nredis_url = \"redis://cache:6379\"\nmax_attempts = 5\n\n[health]\nservices = [\"ledger\"]"
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.queue.backend, BackendKind::Redis);
        assert_eq!(settings.queue.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(settings.queue.max_attempts, 5);
        assert_eq!(settings.queue.poll_interval_ms, 100);
        assert_eq!(settings.health.services, vec!["ledger".to_string()]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = Settings::load_from("/nonexistent/resilience.toml").unwrap_err();
        assert!(matches!(err, SettingsError::Load(_)));
    }
}
