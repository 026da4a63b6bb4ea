//! Modbus meter fleet gateway
//!
//! Polls a fleet of energy meters over Modbus TCP on a fixed cadence,
//! decodes the raw register words through per-model templates and
//! republishes the readings as JSON telemetry over MQTT. Configuration
//! updates arrive over MQTT as well and are persisted atomically.

pub mod config;
pub mod metering_modbus;
pub mod mqtt;
pub mod registers;
pub mod telemetry;
pub mod templates;

// Re-export common types for easier access
pub use config::{ConfigDocument, ConfigStore, Identity, MeterConfig};
pub use metering_modbus::{read_all_meters, MeterReading};
pub use mqtt::{MqttManager, Transmission};
pub use telemetry::TelemetryManager;
pub use templates::TemplateStore;

use chrono::{SecondsFormat, Utc};

/// Current UTC time in the shape the `ts` payload field carries,
/// `2026-08-23T10:11:12.131Z`.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
