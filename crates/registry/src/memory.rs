use std::{
	collections::{BTreeMap, HashMap},
	ops::Bound,
	sync::Arc,
};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
	entry::{RegistryEntry, StateCounts, SyncState},
	error::Error,
	resource::{ResourceId, ResourceType},
	store::RegistryStore,
};

type Key = (ResourceType, ResourceId);

/// Process-local registry, cheap to clone, all clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRegistry {
	entries: Arc<RwLock<BTreeMap<Key, RegistryEntry>>>,
}

impl InMemoryRegistry {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn len(&self) -> usize {
		self.entries.read().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.entries.read().await.is_empty()
	}

	async fn scan(
		&self,
		resource_type: ResourceType,
		limit: usize,
		offset_after: Option<ResourceId>,
		predicate: impl Fn(&RegistryEntry) -> bool + Send,
	) -> Vec<RegistryEntry> {
		let lower = offset_after.map_or(Bound::Included((resource_type, 0)), |after| {
			Bound::Excluded((resource_type, after))
		});

		self.entries
			.read()
			.await
			.range((lower, Bound::Included((resource_type, ResourceId::MAX))))
			.map(|(_, entry)| entry)
			.filter(|entry| predicate(entry))
			.take(limit)
			.cloned()
			.collect()
	}
}

#[async_trait]
impl RegistryStore for InMemoryRegistry {
	async fn find(
		&self,
		resource_type: ResourceType,
		resource_id: ResourceId,
	) -> Result<Option<RegistryEntry>, Error> {
		Ok(self
			.entries
			.read()
			.await
			.get(&(resource_type, resource_id))
			.cloned())
	}

	async fn find_many(
		&self,
		resource_type: ResourceType,
		resource_ids: &[ResourceId],
	) -> Result<HashMap<ResourceId, RegistryEntry>, Error> {
		let entries = self.entries.read().await;

		Ok(resource_ids
			.iter()
			.filter_map(|id| {
				entries
					.get(&(resource_type, *id))
					.map(|entry| (*id, entry.clone()))
			})
			.collect())
	}

	async fn upsert(&self, entry: &RegistryEntry) -> Result<(), Error> {
		self.entries
			.write()
			.await
			.insert((entry.resource_type, entry.resource_id), entry.clone());

		Ok(())
	}

	async fn query_by_state(
		&self,
		resource_type: ResourceType,
		state: SyncState,
		limit: usize,
		offset_after: Option<ResourceId>,
	) -> Result<Vec<RegistryEntry>, Error> {
		Ok(self
			.scan(resource_type, limit, offset_after, |entry| {
				entry.state == state
			})
			.await)
	}

	async fn query_missing_on_primary(
		&self,
		resource_type: ResourceType,
		limit: usize,
		offset_after: Option<ResourceId>,
	) -> Result<Vec<RegistryEntry>, Error> {
		Ok(self
			.scan(resource_type, limit, offset_after, |entry| {
				entry.missing_on_primary
			})
			.await)
	}

	async fn list(
		&self,
		resource_type: ResourceType,
		limit: usize,
		offset_after: Option<ResourceId>,
	) -> Result<Vec<RegistryEntry>, Error> {
		Ok(self.scan(resource_type, limit, offset_after, |_| true).await)
	}

	async fn delete(
		&self,
		resource_type: ResourceType,
		resource_id: ResourceId,
	) -> Result<bool, Error> {
		Ok(self
			.entries
			.write()
			.await
			.remove(&(resource_type, resource_id))
			.is_some())
	}

	async fn counts(
		&self,
		resource_type: ResourceType,
		retry_ceiling: u32,
	) -> Result<StateCounts, Error> {
		Ok(self
			.entries
			.read()
			.await
			.range((resource_type, 0)..=(resource_type, ResourceId::MAX))
			.fold(StateCounts::default(), |mut counts, (_, entry)| {
				counts.record(entry, retry_ceiling);
				counts
			}))
	}

	async fn reset_started(&self, resource_type: ResourceType) -> Result<u64, Error> {
		let mut reset = 0;

		for (_, entry) in self
			.entries
			.write()
			.await
			.range_mut((resource_type, 0)..=(resource_type, ResourceId::MAX))
		{
			if entry.state == SyncState::Started {
				entry.state = SyncState::Pending;
				reset += 1;
			}
		}

		Ok(reset)
	}
}
