//! Logging initialization.

use tracing::*;
use tracing_subscriber::{fmt::layer, layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// Configuration for the stdout logging layer.
#[derive(Debug, Clone, Default)]
pub struct StdoutConfig {
    /// Use JSON format instead of compact format.
    pub json_format: bool,
}

/// Main logger configuration.
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Service name included in the init line.
    pub service_name: String,

    /// Stdout logging configuration.
    pub stdout_config: StdoutConfig,
}

impl LoggerConfig {
    /// Creates a new configuration with service name.
    pub fn new(service_name: String) -> Self {
        Self {
            service_name,
            stdout_config: StdoutConfig::default(),
        }
    }

    /// Enable JSON logging format.
    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.stdout_config.json_format = enabled;
        self
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self::new("(moraine-service)".to_string())
    }
}

/// Initializes the logging subsystem with the provided config.
///
/// Defaults to INFO, overridable via `RUST_LOG`.
pub fn init(config: LoggerConfig) {
    let filt = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();

    let stdout_sub = if config.stdout_config.json_format {
        layer().json().with_filter(filt).boxed()
    } else {
        layer().compact().with_filter(filt).boxed()
    };

    tracing_subscriber::registry().with(stdout_sub).init();

    info!(service_name = %config.service_name, "logging initialized");
}
