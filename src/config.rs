//! Booth configuration, read from a JSON file. Every field has a default.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::print::{PrintError, PrintSpec};
use crate::session::SessionTiming;
use crate::stage::STAGE_MARGIN;

/// Upper bound on `timing.maxCaptureRetries`.
pub const MAX_CAPTURE_RETRIES: u32 = 20;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BoothConfig {
    /// Root of the template store.
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
    #[serde(default)]
    pub timing: SessionTiming,
    /// Fraction of the viewport the capture stage may fill.
    #[serde(default = "default_stage_margin")]
    pub stage_margin: f64,
    #[serde(default)]
    pub print: PrintSpec,
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("booth-data")
}

fn default_stage_margin() -> f64 {
    STAGE_MARGIN
}

impl Default for BoothConfig {
    fn default() -> Self {
        Self {
            store_dir: default_store_dir(),
            timing: SessionTiming::default(),
            stage_margin: default_stage_margin(),
            print: PrintSpec::default(),
        }
    }
}

impl BoothConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: BoothConfig = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        log::debug!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.stage_margin > 0.0 && self.stage_margin <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "stageMargin must be in (0, 1], got {}",
                self.stage_margin
            )));
        }
        if self.timing.tick_ms == 0 {
            return Err(ConfigError::Invalid("timing.tickMs must be positive".to_string()));
        }
        if self.timing.max_capture_retries > MAX_CAPTURE_RETRIES {
            return Err(ConfigError::Invalid(format!(
                "timing.maxCaptureRetries must be at most {}, got {}",
                MAX_CAPTURE_RETRIES, self.timing.max_capture_retries
            )));
        }
        self.print
            .validate()
            .map_err(|e: PrintError| ConfigError::Invalid(e.to_string()))
    }
}
