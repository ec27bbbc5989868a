use std::{fmt, sync::Arc, time::Duration};

use geo_registry::{RegistryError, RegistryStore, ResourceType, StateCounts};
use serde::Serialize;

use crate::{cache::TtlCache, scheduler::SchedulerState};

/// Sync health of one resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeStatus {
	pub resource_type: ResourceType,
	pub counts: StateCounts,
	pub in_flight: usize,
}

/// What operators see of a secondary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeoStatus {
	pub node: String,
	pub state: SchedulerState,
	pub in_flight: usize,
	pub types: Vec<TypeStatus>,
}

/// Registry counts, cached since aggregating a large registry isn't free.
pub(crate) struct StatusCounter {
	registry: Arc<dyn RegistryStore>,
	retry_ceiling: u32,
	cache: TtlCache<ResourceType, StateCounts>,
}

impl fmt::Debug for StatusCounter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("StatusCounter")
			.field("retry_ceiling", &self.retry_ceiling)
			.field("ttl", &self.cache.ttl())
			.finish_non_exhaustive()
	}
}

impl StatusCounter {
	pub(crate) fn new(registry: Arc<dyn RegistryStore>, retry_ceiling: u32, ttl: Duration) -> Self {
		Self {
			registry,
			retry_ceiling,
			cache: TtlCache::new(ttl, ResourceType::all().count()),
		}
	}

	pub(crate) async fn counts(
		&self,
		resource_type: ResourceType,
	) -> Result<StateCounts, RegistryError> {
		if let Some(counts) = self.cache.get(&resource_type).await {
			return Ok(counts);
		}

		let counts = self
			.registry
			.counts(resource_type, self.retry_ceiling)
			.await?;
		self.cache.set(resource_type, counts).await;

		Ok(counts)
	}

	pub(crate) async fn invalidate(&self, resource_type: ResourceType) {
		self.cache.invalidate(&resource_type).await;
	}
}
