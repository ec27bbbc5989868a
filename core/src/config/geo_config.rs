use std::{
	collections::{BTreeMap, HashSet},
	fs,
	path::{Path, PathBuf},
	time::Duration,
};

use geo_registry::ResourceType;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use super::ConfigError;

pub const CONFIG_FILE_NAME: &str = "geo.json";

/// Bumped whenever a field changes meaning, older files are rewritten on load.
const CONFIG_VERSION: u32 = 1;

/// Identity of this secondary and how to reach its primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
	pub name: String,
	pub primary_url: Url,
	/// Bearer token sent on every request to the primary
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub access_token: Option<String>,
}

impl Default for NodeConfig {
	fn default() -> Self {
		Self {
			name: "secondary".to_string(),
			primary_url: Url::parse("http://localhost:3000").expect("hardcoded url is valid"),
			access_token: None,
		}
	}
}

/// Exponential backoff between failed sync attempts of the same resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBackoff {
	pub base_seconds: u64,
	pub max_seconds: u64,
}

impl Default for RetryBackoff {
	fn default() -> Self {
		Self {
			base_seconds: 30,
			max_seconds: 3600,
		}
	}
}

impl RetryBackoff {
	/// Delay before attempt number `retry_count + 1`, doubling from `base_seconds` and capped
	/// at `max_seconds`.
	#[must_use]
	pub fn delay_for(&self, retry_count: u32) -> Duration {
		let exponent = retry_count.saturating_sub(1).min(32);
		let delay = self
			.base_seconds
			.saturating_mul(1_u64 << exponent)
			.min(self.max_seconds);

		Duration::from_secs(delay)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum RegistryBackend {
	/// Relative paths are resolved against the data directory
	Sqlite { path: PathBuf },
	Memory,
}

impl Default for RegistryBackend {
	fn default() -> Self {
		Self::Sqlite {
			path: PathBuf::from("registry.db"),
		}
	}
}

/// Main configuration of a Geo secondary node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
	/// Config schema version
	pub version: u32,

	/// Directory holding this file, logs, the registry and replicated data
	#[serde(skip)]
	pub data_dir: PathBuf,

	pub node: NodeConfig,

	/// Global cap on sync jobs in flight, also the worker pool size
	pub max_concurrency: usize,

	pub dispatch_interval_seconds: u64,

	/// Failed attempts after which a resource needs a manual resync
	pub retry_ceiling: u32,

	pub retry_backoff: RetryBackoff,

	/// How long to wait before checking again a resource the primary lost
	pub missing_recheck_seconds: u64,

	/// Overrides of the default sync timeout of each resource type
	pub per_type_timeout_seconds: BTreeMap<ResourceType, u64>,

	/// Resource types to replicate, in dispatch order
	pub resource_types: Vec<ResourceType>,

	pub drain_grace_seconds: u64,

	pub catalog_cache_ttl_seconds: u64,

	pub status_cache_ttl_seconds: u64,

	pub consistency_interval_seconds: u64,

	/// How often synced entries are compared with the primary's checksums, 0 compares on every
	/// dispatch tick
	pub drift_check_interval_seconds: u64,

	/// Where replicated blobs and repositories land, defaults to `<data_dir>/storage`
	#[serde(skip_serializing_if = "Option::is_none")]
	pub storage_dir: Option<PathBuf>,

	pub registry: RegistryBackend,
}

impl Default for GeoConfig {
	fn default() -> Self {
		Self::default_with_dir(PathBuf::from("."))
	}
}

impl GeoConfig {
	/// Default configuration rooted at `data_dir`
	#[must_use]
	pub fn default_with_dir(data_dir: PathBuf) -> Self {
		Self {
			version: CONFIG_VERSION,
			data_dir,
			node: NodeConfig::default(),
			max_concurrency: 50,
			dispatch_interval_seconds: 10,
			retry_ceiling: 10,
			retry_backoff: RetryBackoff::default(),
			missing_recheck_seconds: 3600,
			per_type_timeout_seconds: BTreeMap::new(),
			resource_types: ResourceType::all().collect(),
			drain_grace_seconds: 30,
			catalog_cache_ttl_seconds: 60,
			status_cache_ttl_seconds: 15,
			consistency_interval_seconds: 600,
			drift_check_interval_seconds: 300,
			storage_dir: None,
			registry: RegistryBackend::default(),
		}
	}

	/// Loads `geo.json` from `data_dir`, creating it with defaults when missing
	pub fn load_from(data_dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let data_dir = data_dir.as_ref();
		let config_path = data_dir.join(CONFIG_FILE_NAME);

		if !config_path.exists() {
			warn!(path = %config_path.display(), "No config found, creating default");
			let config = Self::default_with_dir(data_dir.to_path_buf());
			config.save()?;
			return Ok(config);
		}

		info!(path = %config_path.display(), "Loading config");
		let json = fs::read_to_string(&config_path).map_err(|source| ConfigError::Io {
			path: config_path.clone(),
			source,
		})?;

		let mut config = serde_json::from_str::<Self>(&json)?;
		config.data_dir = data_dir.to_path_buf();
		config.validate()?;

		if config.version < CONFIG_VERSION {
			info!(
				from = config.version,
				to = CONFIG_VERSION,
				"Migrating config"
			);
			config.version = CONFIG_VERSION;
			config.save()?;
		}

		Ok(config)
	}

	pub fn save(&self) -> Result<(), ConfigError> {
		fs::create_dir_all(&self.data_dir).map_err(|source| ConfigError::Io {
			path: self.data_dir.clone(),
			source,
		})?;

		let config_path = self.data_dir.join(CONFIG_FILE_NAME);
		let json = serde_json::to_string_pretty(self)?;
		fs::write(&config_path, json).map_err(|source| ConfigError::Io {
			path: config_path.clone(),
			source,
		})?;

		info!(path = %config_path.display(), "Saved config");
		Ok(())
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.max_concurrency == 0 {
			return Err(ConfigError::Invalid(
				"max_concurrency must be at least 1".to_string(),
			));
		}

		if self.dispatch_interval_seconds == 0 {
			return Err(ConfigError::Invalid(
				"dispatch_interval_seconds must be at least 1".to_string(),
			));
		}

		if self.retry_ceiling == 0 {
			return Err(ConfigError::Invalid(
				"retry_ceiling must be at least 1".to_string(),
			));
		}

		if self.resource_types.is_empty() {
			return Err(ConfigError::Invalid(
				"resource_types must name at least one type".to_string(),
			));
		}

		let mut seen = HashSet::with_capacity(self.resource_types.len());
		if let Some(duplicated) = self
			.resource_types
			.iter()
			.find(|resource_type| !seen.insert(**resource_type))
		{
			return Err(ConfigError::Invalid(format!(
				"resource type {duplicated} is listed more than once"
			)));
		}

		if !matches!(self.node.primary_url.scheme(), "http" | "https") {
			return Err(ConfigError::Invalid(format!(
				"primary_url must be an http(s) url, got {}",
				self.node.primary_url
			)));
		}

		Ok(())
	}

	/// Sync timeout of one resource of `resource_type`
	#[must_use]
	pub fn timeout_for(&self, resource_type: ResourceType) -> Duration {
		self.per_type_timeout_seconds
			.get(&resource_type)
			.map_or_else(
				|| resource_type.descriptor().default_timeout,
				|seconds| Duration::from_secs(*seconds),
			)
	}

	#[must_use]
	pub const fn dispatch_interval(&self) -> Duration {
		Duration::from_secs(self.dispatch_interval_seconds)
	}

	#[must_use]
	pub const fn missing_recheck(&self) -> Duration {
		Duration::from_secs(self.missing_recheck_seconds)
	}

	#[must_use]
	pub const fn drain_grace(&self) -> Duration {
		Duration::from_secs(self.drain_grace_seconds)
	}

	#[must_use]
	pub const fn catalog_cache_ttl(&self) -> Duration {
		Duration::from_secs(self.catalog_cache_ttl_seconds)
	}

	#[must_use]
	pub const fn status_cache_ttl(&self) -> Duration {
		Duration::from_secs(self.status_cache_ttl_seconds)
	}

	#[must_use]
	pub const fn consistency_interval(&self) -> Duration {
		Duration::from_secs(self.consistency_interval_seconds)
	}

	#[must_use]
	pub const fn drift_check_interval(&self) -> Duration {
		Duration::from_secs(self.drift_check_interval_seconds)
	}

	#[must_use]
	pub fn storage_dir(&self) -> PathBuf {
		self.storage_dir
			.as_ref()
			.map_or_else(|| self.data_dir.join("storage"), |dir| self.data_dir.join(dir))
	}

	#[must_use]
	pub fn logs_dir(&self) -> PathBuf {
		self.data_dir.join("logs")
	}

	/// Registry database file, `None` for the in-memory backend
	#[must_use]
	pub fn registry_path(&self) -> Option<PathBuf> {
		match &self.registry {
			RegistryBackend::Sqlite { path } => Some(self.data_dir.join(path)),
			RegistryBackend::Memory => None,
		}
	}
}
