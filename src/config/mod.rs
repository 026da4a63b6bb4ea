use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

fn meter_port_default() -> u16 { 502 }

/* Port 0 and null both mean "use the default", like an absent field. */
fn meter_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Option::<u16>::deserialize(deserializer)? {
        Some(0) | None => Ok(meter_port_default()),
        Some(port) => Ok(port),
    }
}

/// One meter entry of the gateway configuration. The JSON field is
/// `unitId`, matching what the management side publishes.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MeterConfig {
    pub meter: String,
    pub ip: String,
    #[serde(default = "meter_port_default", deserialize_with = "meter_port")]
    pub port: u16,
    #[serde(rename = "unitId")]
    pub unit_id: u8,
    pub model: String,
}

/// The persisted gateway configuration, `config/meters.json`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ConfigDocument {
    pub site: String,
    pub gw: String,
    pub meters: Vec<MeterConfig>,
}

/// Site/gateway pair snapshotted from the current document. Both stay
/// empty until a first configuration arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub site: String,
    pub gw: String,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigValidationError {
    #[error("Config is not a JSON object")]
    NotAnObject,
    #[error("Missing site")]
    MissingSite,
    #[error("Missing gw")]
    MissingGw,
    #[error("meters must be an array")]
    MetersNotAnArray,
    #[error("Each meter requires meter, ip, unitId, model (entry {0})")]
    IncompleteMeter(usize),
    #[error("Config has the wrong shape: {0}")]
    WrongShape(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config payload is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Validation(#[from] ConfigValidationError),
    #[error("config could not be written: {0}")]
    Io(#[from] std::io::Error),
}

/* Remote configs come from javascript tooling, so field presence is
 * judged the way javascript would: null, 0, "" and absent all count
 * as missing. */
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Check an untyped candidate document against the structural rules.
pub fn validate_document(doc: &Value) -> Result<(), ConfigValidationError> {
    let Some(obj) = doc.as_object() else {
        return Err(ConfigValidationError::NotAnObject);
    };

    match obj.get("site") {
        Some(Value::String(s)) if !s.is_empty() => {}
        _ => return Err(ConfigValidationError::MissingSite),
    }
    match obj.get("gw") {
        Some(Value::String(s)) if !s.is_empty() => {}
        _ => return Err(ConfigValidationError::MissingGw),
    }

    let Some(meters) = obj.get("meters").and_then(Value::as_array) else {
        return Err(ConfigValidationError::MetersNotAnArray);
    };
    for (index, meter) in meters.iter().enumerate() {
        let complete = ["meter", "ip", "unitId", "model"]
            .iter()
            .all(|key| meter.get(*key).is_some_and(is_truthy));
        if !complete {
            return Err(ConfigValidationError::IncompleteMeter(index));
        }
    }

    Ok(())
}

/// Parse raw payload bytes into a validated document. Structural rules
/// first, then the typed shape; a field of the wrong type (a numeric
/// meter name for instance) passes the former and fails the latter.
pub fn parse_document(payload: &[u8]) -> Result<ConfigDocument, ConfigError> {
    let value: Value = serde_json::from_slice(payload)?;
    validate_document(&value)?;
    let document = serde_json::from_value(value)
        .map_err(|e| ConfigValidationError::WrongShape(e.to_string()))?;
    Ok(document)
}

impl ConfigDocument {
    /// Same rules as [`validate_document`], applied to an already typed
    /// document before it is persisted.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.site.is_empty() {
            return Err(ConfigValidationError::MissingSite);
        }
        if self.gw.is_empty() {
            return Err(ConfigValidationError::MissingGw);
        }
        for (index, m) in self.meters.iter().enumerate() {
            if m.meter.is_empty() || m.ip.is_empty() || m.unit_id == 0 || m.model.is_empty() {
                return Err(ConfigValidationError::IncompleteMeter(index));
            }
        }
        Ok(())
    }
}

/// Owns `meters.json` and its backup. Everything else only ever sees
/// snapshots handed out by [`read_current`](ConfigStore::read_current).
pub struct ConfigStore {
    config_path: PathBuf,
    backup_path: PathBuf,
    tmp_path: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: &Path) -> Self {
        ConfigStore {
            config_path: dir.join("meters.json"),
            backup_path: dir.join("meters.json.bak"),
            tmp_path: dir.join("meters.json.tmp"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// A missing, unreadable or malformed file all mean "not configured
    /// yet". Never errors.
    pub fn read_current(&self) -> Option<ConfigDocument> {
        let contents = fs::read_to_string(&self.config_path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    pub fn current_identity(&self) -> Identity {
        match self.read_current() {
            Some(document) => Identity {
                site: document.site,
                gw: document.gw,
            },
            None => Identity {
                site: String::new(),
                gw: String::new(),
            },
        }
    }

    /// Validate and persist a new document. The previous file is copied
    /// aside first, then the candidate is written to a temp path and
    /// renamed over the target, so a crash mid-write never leaves a
    /// half-written `meters.json` behind. An invalid document touches
    /// nothing on disk.
    pub fn replace(&self, document: &ConfigDocument) -> Result<(), ConfigError> {
        document.validate()?;

        /* The backup is best effort, a failure must not block the update */
        if self.config_path.exists() {
            if let Err(e) = fs::copy(&self.config_path, &self.backup_path) {
                warn!("Backing up {} failed: {e}", self.config_path.display());
            }
        }

        let contents = serde_json::to_string_pretty(document).map_err(std::io::Error::from)?;
        fs::write(&self.tmp_path, contents)?;
        fs::rename(&self.tmp_path, &self.config_path)?;
        Ok(())
    }
}
