//! Run configuration.
//!
//! Settings come from an optional JSON file and are then overridden by
//! command-line flags. Every field has a default, so `{}` is a valid file.

use crate::cpu::ExecMode;
use serde::{Serialize, Deserialize};
use std::path::Path;
use thiserror::Error;

/// Default tick limit for a run.
pub const DEFAULT_MAX_CYCLES: u64 = 10_000;

/// How to print the final machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DumpFormat {
    #[default]
    Text,
    Json,
    None,
}

/// Simulation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimConfig {
    /// Engine used for `run`.
    #[serde(default)]
    pub mode: ExecMode,

    /// Stop after this many ticks even if the program has not halted.
    #[serde(default = "SimConfig::default_max_cycles")]
    pub max_cycles: u64,

    /// Log every stage and retired instruction.
    #[serde(default)]
    pub trace: bool,

    /// Final state dump format.
    #[serde(default)]
    pub dump: DumpFormat,
}

impl SimConfig {
    fn default_max_cycles() -> u64 {
        DEFAULT_MAX_CYCLES
    }

    /// Read a JSON config file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            mode: ExecMode::default(),
            max_cycles: DEFAULT_MAX_CYCLES,
            trace: false,
            dump: DumpFormat::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {message}")]
    Io { path: String, message: String },

    #[error("invalid config: {0}")]
    Parse(String),
}
