//! Node configuration management

use std::{io, path::PathBuf};

use thiserror::Error;

mod geo_config;

pub use geo_config::{GeoConfig, NodeConfig, RegistryBackend, RetryBackoff, CONFIG_FILE_NAME};

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to access config file <path='{}'>: {source}", .path.display())]
	Io {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
	#[error("malformed config file: {0}")]
	Serde(#[from] serde_json::Error),
	#[error("invalid config: {0}")]
	Invalid(String),
}
