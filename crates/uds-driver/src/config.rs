//! Driver configuration: table size, buffer capacity, backlog and ancillary limits.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
//  Errors
// ---------------------------------------------------------------------------

/// Errors loading or validating a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, miette::Diagnostic)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read config file {path}: {detail}")]
    #[diagnostic(code(uds::config::read))]
    Read { path: String, detail: String },

    /// The file is not valid TOML for this configuration.
    #[error("config parse error: {detail}")]
    #[diagnostic(code(uds::config::parse))]
    Parse { detail: String },

    /// A parameter is out of its allowed range.
    #[error("invalid value for {param}: {value}")]
    #[diagnostic(code(uds::config::invalid_value))]
    InvalidValue { param: String, value: String },
}

// ---------------------------------------------------------------------------
//  DriverConfig
// ---------------------------------------------------------------------------

/// Tunables of the socket driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Number of descriptor slots, including the reserved control slot.
    #[serde(default = "default_table_size")]
    pub table_size: usize,
    /// Size of each socket's receive buffer in bytes.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Largest backlog a listener may request.
    #[serde(default = "default_max_backlog")]
    pub max_backlog: usize,
    /// Most file handles queued on one socket as ancillary data.
    #[serde(default = "default_max_ancillary_files")]
    pub max_ancillary_files: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            table_size: default_table_size(),
            buffer_capacity: default_buffer_capacity(),
            max_backlog: default_max_backlog(),
            max_ancillary_files: default_max_ancillary_files(),
        }
    }
}

impl DriverConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_string(),
            detail: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            detail: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every parameter is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Slot 0 is reserved, so at least two slots are needed for one socket.
        if self.table_size < 2 {
            return Err(invalid("table_size", self.table_size));
        }
        if self.buffer_capacity == 0 {
            return Err(invalid("buffer_capacity", self.buffer_capacity));
        }
        if self.max_backlog == 0 {
            return Err(invalid("max_backlog", self.max_backlog));
        }
        Ok(())
    }
}

fn invalid(param: &str, value: usize) -> ConfigError {
    ConfigError::InvalidValue {
        param: param.to_string(),
        value: value.to_string(),
    }
}

fn default_table_size() -> usize {
    256
}

fn default_buffer_capacity() -> usize {
    32768 // PIPE_BUF
}

fn default_max_backlog() -> usize {
    64 // SOMAXCONN
}

fn default_max_ancillary_files() -> usize {
    255 // OPEN_MAX
}

// ===========================================================================
//  Tests
// ===========================================================================
