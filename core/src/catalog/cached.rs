use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use geo_registry::{ResourceId, ResourceType};
use tracing::trace;

use crate::cache::TtlCache;

use super::{CatalogError, PrimaryCatalog, PrimaryResource};

const DEFAULT_CAPACITY: usize = 100_000;

/// Memoizes per-resource lookups of another catalog for a fixed time-to-live.
///
/// Absent resources are memoized too. Listings always reach the inner catalog.
#[derive(Debug)]
pub struct CachedCatalog<C> {
	inner: C,
	lookups: TtlCache<(ResourceType, ResourceId), Option<PrimaryResource>>,
}

impl<C: PrimaryCatalog> CachedCatalog<C> {
	#[must_use]
	pub fn new(inner: C, ttl: Duration) -> Self {
		Self::with_capacity(inner, ttl, DEFAULT_CAPACITY)
	}

	#[must_use]
	pub fn with_capacity(inner: C, ttl: Duration, capacity: usize) -> Self {
		Self {
			inner,
			lookups: TtlCache::new(ttl, capacity),
		}
	}

	pub const fn inner(&self) -> &C {
		&self.inner
	}
}

#[async_trait]
impl<C: PrimaryCatalog> PrimaryCatalog for CachedCatalog<C> {
	async fn list_resources(
		&self,
		resource_type: ResourceType,
		after: Option<ResourceId>,
		limit: usize,
	) -> Result<Vec<PrimaryResource>, CatalogError> {
		self.inner.list_resources(resource_type, after, limit).await
	}

	async fn find_many(
		&self,
		resource_type: ResourceType,
		ids: &[ResourceId],
	) -> Result<HashMap<ResourceId, PrimaryResource>, CatalogError> {
		let mut found = HashMap::with_capacity(ids.len());
		let mut misses = Vec::new();

		for id in ids {
			match self.lookups.get(&(resource_type, *id)).await {
				Some(Some(resource)) => {
					found.insert(*id, resource);
				}
				Some(None) => {}
				None => misses.push(*id),
			}
		}

		if misses.is_empty() {
			return Ok(found);
		}

		trace!(
			%resource_type,
			hits = ids.len() - misses.len(),
			misses = misses.len(),
			"Catalog lookup"
		);

		let mut fetched = self.inner.find_many(resource_type, &misses).await?;

		for id in misses {
			let resource = fetched.remove(&id);
			self.lookups
				.set((resource_type, id), resource.clone())
				.await;
			if let Some(resource) = resource {
				found.insert(id, resource);
			}
		}

		Ok(found)
	}

	async fn invalidate(&self, resource_type: ResourceType) {
		let dropped = self
			.lookups
			.invalidate_where(|(cached_type, _)| *cached_type == resource_type)
			.await;

		trace!(%resource_type, %dropped, "Invalidated catalog lookups");

		self.inner.invalidate(resource_type).await;
	}
}
