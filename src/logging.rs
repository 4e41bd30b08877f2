use crate::config::{LogFormat, LogSettings};
use crate::error::{LoyaltyError, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Builds the level filter. `RUST_LOG` wins over the configured directives.
pub fn env_filter(settings: &LogSettings) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .map_err(|e| {
            LoyaltyError::Config(::config::ConfigError::Message(format!(
                "Invalid log level {:?}: {e}",
                settings.level
            )))
        })
}

/// Installs the global subscriber, writing to stderr. Call once, from the binary.
pub fn init(settings: &LogSettings) -> Result<()> {
    let registry = tracing_subscriber::registry().with(env_filter(settings)?);
    let installed = match settings.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };
    installed.map_err(|e| {
        LoyaltyError::Config(::config::ConfigError::Message(format!(
            "Failed to install tracing subscriber: {e}"
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_names() {
        let format: LogFormat = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(format, LogFormat::Json);
        assert!(serde_json::from_str::<LogFormat>("\"xml\"").is_err());
    }

    #[test]
    fn test_env_filter_accepts_directives() {
        let settings = LogSettings {
            level: "info,loyalty_accrual=debug".to_string(),
            ..Default::default()
        };
        assert!(env_filter(&settings).is_ok());
    }
}
