//! MQTT bridge for Modbus-TCP field devices.
//!
//! Polls holding/input registers described by a remote gauge configuration
//! service (plus optional static points from the config file), decodes the
//! raw 16-bit words into engineering values, and republishes them as
//! retained MQTT messages.
//!
//! # Topics
//!
//! ```text
//! gauge/<gauge_id>/<characteristic_id>
//! ```
//!
//! Payload: `{"value": <number-or-string>}`, published with QoS 1 and the
//! retained flag set.

pub mod config;
pub mod decode;
pub mod publisher;
pub mod reader;
pub mod scheduler;
pub mod source;

// Re-export commonly used types at the crate root
pub use config::{BridgeConfig, PointConfig, RawPointRecord, RegisterKind};
pub use decode::{DataType, DecodedValue, WordOrder, decode};
pub use publisher::{MqttPublisher, ValueSink};
pub use reader::{RegisterReader, TcpRegisterReader};
pub use scheduler::Scheduler;
pub use source::{ConfigSource, HttpConfigSource};

use config::{ConfigError, LogFormat, LoggingConfig};

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - [`LogFormat::Text`] (default): human-readable text
/// - [`LogFormat::Json`]: structured JSON for log aggregation systems
pub fn init_tracing(config: &LoggingConfig) -> Result<(), ConfigError> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| ConfigError::Logging(e.to_string()))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| ConfigError::Logging(e.to_string()))?;
        }
    }

    Ok(())
}
