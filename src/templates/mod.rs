use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use log::info;
use serde::Deserialize;
use thiserror::Error;

use crate::registers::{Endianness, RegisterType};

/// One measured quantity inside a channel. Addresses are 1-based as
/// written in the device documentation; the transport subtracts 1.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub address: u16,
    #[serde(rename = "type")]
    pub reg_type: RegisterType,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChannelSpec {
    pub channel: String,
    pub params: Vec<ParameterSpec>,
}

/// Register layout of one meter model, parsed from `{model}.json`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceTemplate {
    #[serde(default)]
    pub endianness: Endianness,
    pub channels: Vec<ChannelSpec>,
}

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("no template for model {0}")]
    NotFound(String),
    #[error("template for model {model} could not be read: {source}")]
    Unreadable {
        model: String,
        source: std::io::Error,
    },
    #[error("template for model {model} is not valid: {source}")]
    Parse {
        model: String,
        source: serde_json::Error,
    },
    #[error("template for model {model}: parameter {name} has address 0, addresses start at 1")]
    BadAddress { model: String, name: String },
}

/// Loads and caches device templates. A model is read from disk once;
/// later lookups hit the registry.
pub struct TemplateStore {
    user_root: PathBuf,
    shipped_root: PathBuf,
    cache: RwLock<HashMap<String, Arc<DeviceTemplate>>>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::with_roots(PathBuf::from("config/templates"), PathBuf::from("defs/templates"))
    }

    pub fn with_roots(user_root: PathBuf, shipped_root: PathBuf) -> Self {
        TemplateStore {
            user_root,
            shipped_root,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn resolve(&self, model: &str) -> Result<Arc<DeviceTemplate>, TemplateError> {
        if let Some(template) = self.cache.read().unwrap().get(model) {
            return Ok(template.clone());
        }

        let template = Arc::new(self.load(model)?);
        self.cache
            .write()
            .unwrap()
            .insert(model.to_string(), template.clone());
        Ok(template)
    }

    fn load(&self, model: &str) -> Result<DeviceTemplate, TemplateError> {
        /* user provided templates are used first */
        let user = self.user_root.join(format!("{model}.json"));
        let shipped = self.shipped_root.join(format!("{model}.json"));

        let path = if user.is_file() {
            info!("Using user provided template for {model}");
            user
        } else if shipped.is_file() {
            info!("Loading template for {model}");
            shipped
        } else {
            return Err(TemplateError::NotFound(model.to_string()));
        };

        let contents = fs::read_to_string(&path).map_err(|source| TemplateError::Unreadable {
            model: model.to_string(),
            source,
        })?;
        let template: DeviceTemplate =
            serde_json::from_str(&contents).map_err(|source| TemplateError::Parse {
                model: model.to_string(),
                source,
            })?;

        for channel in &template.channels {
            for param in &channel.params {
                if param.address == 0 {
                    return Err(TemplateError::BadAddress {
                        model: model.to_string(),
                        name: param.name.clone(),
                    });
                }
            }
        }

        Ok(template)
    }

    /// List the models that have a template on disk, user root first.
    /// Meant for the startup log; resolution itself stays lazy.
    pub fn scan(&self) -> Vec<String> {
        let mut models = Vec::new();
        for root in [&self.user_root, &self.shipped_root] {
            let Ok(entries) = fs::read_dir(root) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|e| e == "json") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        if !models.iter().any(|m| m == stem) {
                            models.push(stem.to_string());
                        }
                    }
                }
            }
        }
        models.sort();
        models
    }
}
