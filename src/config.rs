//! Layered runtime settings.
//!
//! Sources, later overriding earlier: built-in defaults, `configs/loyalty.yml`
//! (if present), the file given on the command line, then `LOYALTY__*`
//! environment variables (`LOYALTY__WORKER__POOL_SIZE=8`).

use crate::application::dispatcher::DispatcherSettings;
use crate::application::observer::ObserverSettings;
use crate::error::Result;
use ::config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "configs/loyalty";
pub const CONFIG_ENV_PREFIX: &str = "LOYALTY";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub app: AppSettings,
    pub log: LogSettings,
    pub storage: StorageSettings,
    pub accrual: AccrualSettings,
    pub queue: QueueSettings,
    pub worker: WorkerSettings,
    pub outbox: OutboxSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub env: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            env: "development".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// RocksDB directory. In-memory storage when unset.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccrualSettings {
    pub address: String,
    pub request_timeout_secs: u64,
    pub default_retry_after_secs: u64,
    pub min_poll_interval_ms: u64,
    pub max_poll_interval_ms: u64,
}

impl Default for AccrualSettings {
    fn default() -> Self {
        Self {
            address: "http://localhost:8080".to_string(),
            request_timeout_secs: 10,
            default_retry_after_secs: 1,
            min_poll_interval_ms: 500,
            max_poll_interval_ms: 30_000,
        }
    }
}

impl AccrualSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn observer(&self) -> ObserverSettings {
        ObserverSettings {
            default_retry_after: Duration::from_secs(self.default_retry_after_secs),
            min_poll_interval: Duration::from_millis(self.min_poll_interval_ms),
            max_poll_interval: Duration::from_millis(
                self.max_poll_interval_ms.max(self.min_poll_interval_ms),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// AMQP broker URL. In-process queue when unset.
    pub url: Option<String>,
    pub name: String,
    pub prefetch: u16,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            url: None,
            name: "loyalty.reconciliation".to_string(),
            prefetch: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub pool_size: usize,
    pub task_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            pool_size: 16,
            task_timeout_secs: 900,
            shutdown_grace_secs: 30,
        }
    }
}

impl WorkerSettings {
    pub fn dispatcher(&self) -> DispatcherSettings {
        DispatcherSettings {
            pool_size: self.pool_size.max(1),
            task_timeout: Duration::from_secs(self.task_timeout_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxSettings {
    pub relay_interval_secs: u64,
    pub batch_size: usize,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            relay_interval_secs: 5,
            batch_size: 100,
        }
    }
}

impl OutboxSettings {
    pub fn relay_interval(&self) -> Duration {
        Duration::from_secs(self.relay_interval_secs.max(1))
    }
}

impl Settings {
    /// Loads settings from the default file, `path`, and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }
}
