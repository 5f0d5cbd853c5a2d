//! Configuration for the Modbus MQTT bridge.
//!
//! Two layers live here: the bridge's own config file (JSON5), and the
//! point records served by the gauge configuration API, which are
//! normalized into validated [`PointConfig`] values before any polling
//! starts.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::decode::{DataType, WordOrder};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Logging setup failed: {0}")]
    Logging(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Gauge configuration service settings.
    pub source: SourceConfig,

    /// MQTT broker settings.
    pub mqtt: MqttConfig,

    /// Modbus transport settings.
    #[serde(default)]
    pub modbus: ModbusConfig,

    /// Points defined directly in the config file, polled in addition to
    /// whatever the configuration service returns.
    #[serde(default)]
    pub points: Vec<RawPointRecord>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Settings for the remote point configuration service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Endpoint returning the organization's gauge point list.
    #[serde(default)]
    pub url: String,

    /// Seconds between configuration refreshes.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Request timeout in milliseconds.
    #[serde(default = "default_source_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_refresh_interval() -> u64 {
    10
}

fn default_source_timeout_ms() -> u64 {
    5000
}

/// MQTT broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host (IP or hostname).
    pub host: String,

    /// Broker port (default: 1883).
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Client identifier presented to the broker.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Optional username/password credentials.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "mqtt-bridge-modbus".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

/// Modbus transport settings shared by all points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConfig {
    /// Connect/request timeout in milliseconds.
    #[serde(default = "default_modbus_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_modbus_timeout_ms() -> u64 {
    1000
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_modbus_timeout_ms(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = json5::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.host.is_empty() {
            return Err(ConfigError::Validation(
                "MQTT broker host cannot be empty".to_string(),
            ));
        }

        if self.source.url.is_empty() && self.points.is_empty() {
            return Err(ConfigError::Validation(
                "Either a source url or static points must be configured".to_string(),
            ));
        }

        if self.source.refresh_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "source.refresh_interval_secs must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Modbus register kinds supported by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    /// Holding registers (read/write, 16-bit).
    Holding,
    /// Input registers (read-only, 16-bit).
    Input,
}

impl RegisterKind {
    /// Parse a wire spelling.
    ///
    /// The gauge API serves the upstream driver's method names
    /// (`readHoldingRegisters`), while the config file uses the short form.
    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw {
            "readHoldingRegisters" | "holding" => Some(RegisterKind::Holding),
            "readInputRegisters" | "input" => Some(RegisterKind::Input),
            _ => None,
        }
    }

    /// Return the string name for this register kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterKind::Holding => "holding",
            RegisterKind::Input => "input",
        }
    }
}

/// Numeric field the gauge API serves either as a JSON number or as a
/// digit string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumericField {
    Number(i64),
    Text(String),
}

impl NumericField {
    fn as_i64(&self) -> Option<i64> {
        match self {
            NumericField::Number(n) => Some(*n),
            NumericField::Text(s) => s.trim().parse().ok(),
        }
    }

    fn raw(&self) -> String {
        match self {
            NumericField::Number(n) => n.to_string(),
            NumericField::Text(s) => s.clone(),
        }
    }
}

/// One point record as served by the configuration source (or written
/// inline in the config file).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPointRecord {
    /// Device host (IP or hostname).
    pub host: String,

    /// Device TCP port.
    pub port: NumericField,

    /// Register kind, e.g. "readHoldingRegisters" or "holding".
    #[serde(rename = "registertype")]
    pub register_type: String,

    /// Register address; the 5-digit device-facing convention is accepted.
    pub register_address: NumericField,

    /// Decoded data type, e.g. "unsigned_int".
    #[serde(rename = "datatype")]
    pub data_type: String,

    /// Word order, "msb_first" (default) or "lsb_first".
    #[serde(default)]
    pub byte_order: Option<String>,

    /// Poll interval in milliseconds.
    #[serde(default)]
    pub speed: Option<NumericField>,

    /// Register words per read.
    #[serde(default)]
    pub count: Option<NumericField>,

    /// Modbus unit id when one transport serves several logical devices.
    #[serde(default, alias = "slaveId")]
    pub slave_id: Option<NumericField>,

    /// Gauge identity, first half of the point id.
    pub gauge_id: String,

    /// Characteristic identity, second half of the point id.
    pub characteristic_id: String,
}

/// Why a raw point record was rejected.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("field '{field}' is not a valid number: '{value}'")]
    InvalidNumber { field: &'static str, value: String },
    #[error("field '{field}' is out of range: {value}")]
    OutOfRange { field: &'static str, value: i64 },
    #[error("unknown register type '{0}'")]
    UnknownRegisterType(String),
    #[error("unknown data type '{0}'")]
    UnknownDataType(String),
    #[error("unknown word order '{0}'")]
    UnknownWordOrder(String),
    #[error("register count {0} is below the 2-word minimum")]
    CountTooSmall(i64),
    #[error("gauge_id and characteristic_id must both be non-empty")]
    MissingIdentity,
}

/// Base subtracted from addresses supplied in the 5-digit device-facing
/// convention (40001 => protocol address 0).
pub const ADDRESS_BASE: u16 = 40001;

/// Poll interval applied when a record carries none, or a non-positive one.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

const DEFAULT_REGISTER_COUNT: u16 = 2;

/// A validated, immutable description of one pollable value.
#[derive(Debug, Clone, PartialEq)]
pub struct PointConfig {
    pub host: String,
    pub port: u16,
    /// Unit id selected on the transport before the read, when present.
    pub slave: Option<u8>,
    pub register_kind: RegisterKind,
    /// Protocol-relative register address.
    pub address: u16,
    /// Words per read; always at least 2.
    pub count: u16,
    pub data_type: DataType,
    pub word_order: WordOrder,
    pub poll_interval: Duration,
    pub gauge_id: String,
    pub characteristic_id: String,
}

impl PointConfig {
    /// Stable identity used to deduplicate scheduling.
    pub fn point_id(&self) -> String {
        format!("{}/{}", self.gauge_id, self.characteristic_id)
    }

    /// MQTT topic this point publishes to.
    pub fn topic(&self) -> String {
        format!("gauge/{}/{}", self.gauge_id, self.characteristic_id)
    }
}

fn int_field(
    field: &'static str,
    value: &NumericField,
    min: i64,
    max: i64,
) -> Result<i64, RecordError> {
    let parsed = value.as_i64().ok_or_else(|| RecordError::InvalidNumber {
        field,
        value: value.raw(),
    })?;
    if parsed < min || parsed > max {
        return Err(RecordError::OutOfRange {
            field,
            value: parsed,
        });
    }
    Ok(parsed)
}

impl RawPointRecord {
    /// Produce a validated point from this raw record.
    ///
    /// Numeric fields are parsed defensively (the API serves both numbers
    /// and digit strings); any malformed field rejects the record.
    pub fn normalize(&self) -> Result<PointConfig, RecordError> {
        if self.gauge_id.is_empty() || self.characteristic_id.is_empty() {
            return Err(RecordError::MissingIdentity);
        }

        let port = int_field("port", &self.port, 1, u16::MAX as i64)? as u16;

        let register_kind = RegisterKind::from_wire(&self.register_type)
            .ok_or_else(|| RecordError::UnknownRegisterType(self.register_type.clone()))?;

        let mut address = int_field("register_address", &self.register_address, 0, i64::MAX)?;
        if address >= ADDRESS_BASE as i64 {
            address -= ADDRESS_BASE as i64;
        }
        if address > u16::MAX as i64 {
            return Err(RecordError::OutOfRange {
                field: "register_address",
                value: address,
            });
        }

        let data_type = DataType::from_wire(&self.data_type)
            .ok_or_else(|| RecordError::UnknownDataType(self.data_type.clone()))?;

        let word_order = match &self.byte_order {
            Some(raw) => WordOrder::from_wire(raw)
                .ok_or_else(|| RecordError::UnknownWordOrder(raw.clone()))?,
            None => WordOrder::default(),
        };

        let count = match &self.count {
            Some(raw) => int_field("count", raw, i64::MIN, u16::MAX as i64)?,
            None => DEFAULT_REGISTER_COUNT as i64,
        };
        if count < 2 {
            return Err(RecordError::CountTooSmall(count));
        }

        let poll_interval = match &self.speed {
            Some(raw) => {
                let millis = int_field("speed", raw, i64::MIN, i64::MAX)?;
                if millis <= 0 {
                    DEFAULT_POLL_INTERVAL
                } else {
                    Duration::from_millis(millis as u64)
                }
            }
            None => DEFAULT_POLL_INTERVAL,
        };

        let slave = match &self.slave_id {
            Some(raw) => Some(int_field("slave_id", raw, 0, u8::MAX as i64)? as u8),
            None => None,
        };

        Ok(PointConfig {
            host: self.host.clone(),
            port,
            slave,
            register_kind,
            address: address as u16,
            count: count as u16,
            data_type,
            word_order,
            poll_interval,
            gauge_id: self.gauge_id.clone(),
            characteristic_id: self.characteristic_id.clone(),
        })
    }
}

/// Normalize a batch of raw records, logging and skipping invalid ones.
///
/// A bad record never fails the batch.
pub fn normalize_records(records: &[RawPointRecord]) -> Vec<PointConfig> {
    let mut points = Vec::with_capacity(records.len());
    for record in records {
        match record.normalize() {
            Ok(point) => points.push(point),
            Err(e) => {
                warn!(
                    gauge = %record.gauge_id,
                    characteristic = %record.characteristic_id,
                    error = %e,
                    "Skipping invalid point record"
                );
            }
        }
    }
    points
}
