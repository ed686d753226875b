//! Configuration loading from disk.

use std::path::Path;

use thiserror::Error;

use crate::config::schema::EnvelopeConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation failed: {}", format_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn format_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<EnvelopeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: EnvelopeConfig = toml::from_str(&contents)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}
