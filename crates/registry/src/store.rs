use std::collections::HashMap;

use async_trait::async_trait;

use super::{
	entry::{RegistryEntry, StateCounts, SyncState},
	error::Error,
	resource::{ResourceId, ResourceType},
};

/// Persistence contract for registry entries.
///
/// Every listing is ordered by ascending resource id and only returns ids strictly greater than
/// `offset_after`, so callers can page through a type with a keyset cursor.
#[async_trait]
pub trait RegistryStore: Send + Sync + 'static {
	async fn find(
		&self,
		resource_type: ResourceType,
		resource_id: ResourceId,
	) -> Result<Option<RegistryEntry>, Error>;

	async fn find_many(
		&self,
		resource_type: ResourceType,
		resource_ids: &[ResourceId],
	) -> Result<HashMap<ResourceId, RegistryEntry>, Error>;

	/// Inserts the entry or replaces the one with the same `(resource_type, resource_id)` key.
	async fn upsert(&self, entry: &RegistryEntry) -> Result<(), Error>;

	async fn query_by_state(
		&self,
		resource_type: ResourceType,
		state: SyncState,
		limit: usize,
		offset_after: Option<ResourceId>,
	) -> Result<Vec<RegistryEntry>, Error>;

	async fn query_missing_on_primary(
		&self,
		resource_type: ResourceType,
		limit: usize,
		offset_after: Option<ResourceId>,
	) -> Result<Vec<RegistryEntry>, Error>;

	async fn list(
		&self,
		resource_type: ResourceType,
		limit: usize,
		offset_after: Option<ResourceId>,
	) -> Result<Vec<RegistryEntry>, Error>;

	/// Returns whether an entry was actually removed.
	async fn delete(
		&self,
		resource_type: ResourceType,
		resource_id: ResourceId,
	) -> Result<bool, Error>;

	async fn counts(
		&self,
		resource_type: ResourceType,
		retry_ceiling: u32,
	) -> Result<StateCounts, Error>;

	/// Moves every `started` entry of a type back to `pending`, returning how many moved.
	///
	/// Only meaningful when nothing is in flight, i.e. right after a restart.
	async fn reset_started(&self, resource_type: ResourceType) -> Result<u64, Error>;
}
