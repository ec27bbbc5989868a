//! The primary's inventory of replicable resources, as seen from a secondary.

use std::{
	collections::{BTreeMap, HashMap},
	sync::{
		atomic::{AtomicBool, AtomicUsize, Ordering},
		Arc,
	},
};

use async_trait::async_trait;
use geo_registry::{ResourceId, ResourceType};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

mod cached;
mod http;

pub use cached::CachedCatalog;
pub use http::HttpCatalog;

/// One resource the primary holds, with the checksum it reports for it, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryResource {
	pub id: ResourceId,
	#[serde(default)]
	pub checksum: Option<String>,
}

#[derive(Debug, Error)]
pub enum CatalogError {
	#[error("primary catalog is unavailable: {0}")]
	Unavailable(String),
}

#[async_trait]
pub trait PrimaryCatalog: Send + Sync + 'static {
	/// Up to `limit` resources with an id greater than `after`, ascending by id.
	async fn list_resources(
		&self,
		resource_type: ResourceType,
		after: Option<ResourceId>,
		limit: usize,
	) -> Result<Vec<PrimaryResource>, CatalogError>;

	/// The subset of `ids` the primary still has.
	async fn find_many(
		&self,
		resource_type: ResourceType,
		ids: &[ResourceId],
	) -> Result<HashMap<ResourceId, PrimaryResource>, CatalogError>;

	/// Forgets anything memoized about `resource_type`.
	async fn invalidate(&self, _resource_type: ResourceType) {}
}

/// A catalog held in memory, for tests and for simulating several primaries in one process.
#[derive(Debug, Clone)]
pub struct InMemoryCatalog {
	resources: Arc<RwLock<BTreeMap<ResourceType, BTreeMap<ResourceId, PrimaryResource>>>>,
	available: Arc<AtomicBool>,
	queries: Arc<AtomicUsize>,
}

impl Default for InMemoryCatalog {
	fn default() -> Self {
		Self {
			resources: Arc::default(),
			available: Arc::new(AtomicBool::new(true)),
			queries: Arc::default(),
		}
	}
}

impl InMemoryCatalog {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn insert(
		&self,
		resource_type: ResourceType,
		id: ResourceId,
		checksum: Option<&str>,
	) {
		self.resources
			.write()
			.await
			.entry(resource_type)
			.or_default()
			.insert(
				id,
				PrimaryResource {
					id,
					checksum: checksum.map(ToString::to_string),
				},
			);
	}

	pub async fn remove(&self, resource_type: ResourceType, id: ResourceId) -> bool {
		self.resources
			.write()
			.await
			.get_mut(&resource_type)
			.and_then(|resources| resources.remove(&id))
			.is_some()
	}

	/// Makes every following query fail with [`CatalogError::Unavailable`], or recover.
	pub fn set_available(&self, available: bool) {
		self.available.store(available, Ordering::Release);
	}

	/// How many queries reached this catalog so far.
	#[must_use]
	pub fn query_count(&self) -> usize {
		self.queries.load(Ordering::Acquire)
	}

	fn check_available(&self) -> Result<(), CatalogError> {
		self.queries.fetch_add(1, Ordering::AcqRel);

		if self.available.load(Ordering::Acquire) {
			Ok(())
		} else {
			Err(CatalogError::Unavailable("catalog is offline".to_string()))
		}
	}
}

#[async_trait]
impl PrimaryCatalog for InMemoryCatalog {
	async fn list_resources(
		&self,
		resource_type: ResourceType,
		after: Option<ResourceId>,
		limit: usize,
	) -> Result<Vec<PrimaryResource>, CatalogError> {
		self.check_available()?;

		Ok(self
			.resources
			.read()
			.await
			.get(&resource_type)
			.map(|resources| {
				resources
					.values()
					.filter(|resource| after.map_or(true, |after| resource.id > after))
					.take(limit)
					.cloned()
					.collect()
			})
			.unwrap_or_default())
	}

	async fn find_many(
		&self,
		resource_type: ResourceType,
		ids: &[ResourceId],
	) -> Result<HashMap<ResourceId, PrimaryResource>, CatalogError> {
		self.check_available()?;

		let resources = self.resources.read().await;
		let Some(resources) = resources.get(&resource_type) else {
			return Ok(HashMap::new());
		};

		Ok(ids
			.iter()
			.filter_map(|id| resources.get(id).map(|resource| (*id, resource.clone())))
			.collect())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn lists_in_ascending_pages() {
		let catalog = InMemoryCatalog::new();
		for id in [4, 1, 3, 2] {
			catalog.insert(ResourceType::Upload, id, None).await;
		}

		let page = catalog
			.list_resources(ResourceType::Upload, Some(1), 2)
			.await
			.unwrap();
		assert_eq!(page.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 3]);

		assert!(catalog
			.list_resources(ResourceType::LfsObject, None, 10)
			.await
			.unwrap()
			.is_empty());
	}

	#[tokio::test]
	async fn offline_catalog_is_unavailable() {
		let catalog = InMemoryCatalog::new();
		catalog.set_available(false);

		assert!(matches!(
			catalog.find_many(ResourceType::Upload, &[1]).await,
			Err(CatalogError::Unavailable(_))
		));
		assert_eq!(catalog.query_count(), 1);
	}
}
