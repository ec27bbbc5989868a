//! Diffs the primary's inventory against the registry to find resources that need work.

use std::{
	collections::{BTreeMap, HashMap, HashSet},
	sync::Arc,
	time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use geo_registry::{
	RegistryEntry, RegistryError, RegistryStore, ResourceId, ResourceType, SyncState,
};
use thiserror::Error;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, instrument, trace};

use crate::catalog::{CatalogError, PrimaryCatalog};

/// Smallest page requested from the catalog or the registry while scanning.
const MIN_PAGE_SIZE: usize = 100;
const MAX_PAGE_SIZE: usize = 1_000;

/// How often synced entries are compared with the primary unless told otherwise.
pub const DEFAULT_DRIFT_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum FinderError {
	#[error("resource storage is unavailable: {0}")]
	StorageUnavailable(String),
}

impl From<CatalogError> for FinderError {
	fn from(e: CatalogError) -> Self {
		Self::StorageUnavailable(e.to_string())
	}
}

impl From<RegistryError> for FinderError {
	fn from(e: RegistryError) -> Self {
		Self::StorageUnavailable(e.to_string())
	}
}

/// The three queries a job finder draws from. Every listing is ascending by id, holds at most
/// `batch_size` ids and none of `excluded_ids`.
#[async_trait]
pub trait ResourceFinder: Send + Sync + 'static {
	/// Resources the primary has that were never synced.
	async fn list_never_synced(
		&self,
		resource_type: ResourceType,
		batch_size: usize,
		excluded_ids: &HashSet<ResourceId>,
	) -> Result<Vec<ResourceId>, FinderError>;

	/// Failed resources that still have retries left, then synced resources whose checksum
	/// drifted from the primary's.
	async fn list_needing_resync(
		&self,
		resource_type: ResourceType,
		batch_size: usize,
		excluded_ids: &HashSet<ResourceId>,
	) -> Result<Vec<ResourceId>, FinderError>;

	/// Resources the primary lost, due for a re-verification.
	async fn list_missing_on_primary(
		&self,
		resource_type: ResourceType,
		batch_size: usize,
		excluded_ids: &HashSet<ResourceId>,
	) -> Result<Vec<ResourceId>, FinderError>;

	/// Forgets what earlier listings of the type established, the next ones start over.
	async fn rescan(&self, _resource_type: ResourceType) {}
}

/// Which failed entries may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
	pub retry_ceiling: u32,
}

impl RetryPolicy {
	#[must_use]
	pub fn is_retryable(&self, entry: &RegistryEntry, now: DateTime<Utc>) -> bool {
		entry.state == SyncState::Failed
			&& !entry.missing_on_primary
			&& entry.retry_count < self.retry_ceiling
			&& !entry.is_backing_off(now)
	}

	#[must_use]
	pub fn is_due_for_recheck(entry: &RegistryEntry, now: DateTime<Utc>) -> bool {
		entry.missing_on_primary && !entry.is_backing_off(now)
	}
}

/// How a synced entry looked when its checksum was found to differ from the primary's.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DriftedEntry {
	checksum: Option<String>,
	last_synced_at: Option<DateTime<Utc>>,
}

impl DriftedEntry {
	fn of(entry: &RegistryEntry) -> Self {
		Self {
			checksum: entry.checksum.clone(),
			last_synced_at: entry.last_synced_at,
		}
	}

	/// Still synced and untouched since the drift was seen.
	fn is_unchanged(&self, entry: &RegistryEntry) -> bool {
		entry.state == SyncState::Synced
			&& entry.checksum == self.checksum
			&& entry.last_synced_at == self.last_synced_at
	}
}

/// What earlier listings of one type established.
#[derive(Debug, Default)]
struct ScanProgress {
	/// Every catalog id up to this one had a registry entry
	registered_up_to: Option<ResourceId>,
	drift_checked_at: Option<Instant>,
	drifted: BTreeMap<ResourceId, DriftedEntry>,
}

/// [`ResourceFinder`] reading the primary through a [`PrimaryCatalog`] and the secondary's state
/// through a [`RegistryStore`].
///
/// The catalog is only read past the highest id whose whole prefix is already registered, and
/// synced entries are compared with the primary's checksums once per drift interval. Both are
/// forgotten by [`ResourceFinder::rescan`].
pub struct RegistryResourceFinder {
	registry: Arc<dyn RegistryStore>,
	catalog: Arc<dyn PrimaryCatalog>,
	policy: RetryPolicy,
	drift_interval: Duration,
	progress: Mutex<HashMap<ResourceType, ScanProgress>>,
}

impl std::fmt::Debug for RegistryResourceFinder {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RegistryResourceFinder")
			.field("policy", &self.policy)
			.field("drift_interval", &self.drift_interval)
			.finish_non_exhaustive()
	}
}

fn page_size(batch_size: usize) -> usize {
	batch_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
}

impl RegistryResourceFinder {
	#[must_use]
	pub fn new(
		registry: Arc<dyn RegistryStore>,
		catalog: Arc<dyn PrimaryCatalog>,
		policy: RetryPolicy,
	) -> Self {
		Self {
			registry,
			catalog,
			policy,
			drift_interval: DEFAULT_DRIFT_INTERVAL,
			progress: Mutex::default(),
		}
	}

	/// Zero compares synced entries with the primary on every listing.
	#[must_use]
	pub const fn with_drift_interval(mut self, drift_interval: Duration) -> Self {
		self.drift_interval = drift_interval;
		self
	}

	/// Pending entries the primary still has.
	async fn pending_on_primary(
		&self,
		resource_type: ResourceType,
		batch_size: usize,
		excluded_ids: &HashSet<ResourceId>,
		found: &mut Vec<ResourceId>,
	) -> Result<(), FinderError> {
		let page = page_size(batch_size);
		let mut cursor = None;

		while found.len() < batch_size {
			let entries = self
				.registry
				.query_by_state(resource_type, SyncState::Pending, page, cursor)
				.await?;

			let Some(last) = entries.last() else {
				break;
			};
			cursor = Some(last.resource_id);
			let exhausted = entries.len() < page;

			let candidates = entries
				.iter()
				.map(|entry| entry.resource_id)
				.filter(|id| !excluded_ids.contains(id))
				.collect::<Vec<_>>();

			if !candidates.is_empty() {
				let primary = self.catalog.find_many(resource_type, &candidates).await?;

				found.extend(
					candidates
						.into_iter()
						.filter(|id| primary.contains_key(id))
						.take(batch_size - found.len()),
				);
			}

			if exhausted {
				break;
			}
		}

		Ok(())
	}

	/// Catalog ids without any registry entry, read from the registered prefix onwards.
	async fn unregistered_on_primary(
		&self,
		resource_type: ResourceType,
		batch_size: usize,
		excluded_ids: &HashSet<ResourceId>,
		found: &mut Vec<ResourceId>,
	) -> Result<(), FinderError> {
		let start = self
			.progress
			.lock()
			.await
			.get(&resource_type)
			.and_then(|progress| progress.registered_up_to);

		let page = page_size(batch_size);
		let mut cursor = start;
		let mut registered_up_to = start;
		let mut prefix_registered = true;

		while found.len() < batch_size {
			let resources = self
				.catalog
				.list_resources(resource_type, cursor, page)
				.await?;

			let Some(last) = resources.last() else {
				break;
			};
			cursor = Some(last.id);
			let exhausted = resources.len() < page;

			let ids = resources
				.iter()
				.map(|resource| resource.id)
				.collect::<Vec<_>>();
			let known = self.registry.find_many(resource_type, &ids).await?;

			for id in ids {
				if known.contains_key(&id) {
					if prefix_registered {
						registered_up_to = Some(id);
					}
					continue;
				}

				prefix_registered = false;
				if found.len() < batch_size && !excluded_ids.contains(&id) {
					found.push(id);
				}
			}

			if exhausted {
				break;
			}
		}

		if registered_up_to != start {
			let mut progress = self.progress.lock().await;
			let progress = progress.entry(resource_type).or_default();
			if progress.registered_up_to == start {
				progress.registered_up_to = registered_up_to;
			}
		}

		Ok(())
	}

	async fn failed_with_retries_left(
		&self,
		resource_type: ResourceType,
		batch_size: usize,
		excluded_ids: &HashSet<ResourceId>,
		now: DateTime<Utc>,
		found: &mut Vec<ResourceId>,
	) -> Result<(), FinderError> {
		let page = page_size(batch_size);
		let mut cursor = None;

		while found.len() < batch_size {
			let entries = self
				.registry
				.query_by_state(resource_type, SyncState::Failed, page, cursor)
				.await?;

			let Some(last) = entries.last() else {
				break;
			};
			cursor = Some(last.resource_id);
			let exhausted = entries.len() < page;

			found.extend(
				entries
					.iter()
					.filter(|entry| {
						!excluded_ids.contains(&entry.resource_id)
							&& self.policy.is_retryable(entry, now)
					})
					.map(|entry| entry.resource_id)
					.take(batch_size - found.len()),
			);

			if exhausted {
				break;
			}
		}

		Ok(())
	}

	/// Compares every synced entry with the primary's checksum, once per drift interval.
	async fn refresh_drift(&self, resource_type: ResourceType) -> Result<(), FinderError> {
		let due = self
			.progress
			.lock()
			.await
			.get(&resource_type)
			.and_then(|progress| progress.drift_checked_at)
			.map_or(true, |checked_at| checked_at.elapsed() >= self.drift_interval);

		if !due {
			return Ok(());
		}

		let mut drifted = BTreeMap::new();
		let mut cursor = None;

		loop {
			let entries = self
				.registry
				.query_by_state(resource_type, SyncState::Synced, MAX_PAGE_SIZE, cursor)
				.await?;

			let Some(last) = entries.last() else {
				break;
			};
			cursor = Some(last.resource_id);
			let exhausted = entries.len() < MAX_PAGE_SIZE;

			let ids = entries
				.iter()
				.map(|entry| entry.resource_id)
				.collect::<Vec<_>>();
			let primary = self.catalog.find_many(resource_type, &ids).await?;

			drifted.extend(
				entries
					.iter()
					.filter(|entry| {
						primary
							.get(&entry.resource_id)
							.and_then(|resource| resource.checksum.as_deref())
							.is_some_and(|expected| entry.checksum.as_deref() != Some(expected))
					})
					.map(|entry| (entry.resource_id, DriftedEntry::of(entry))),
			);

			if exhausted {
				break;
			}
		}

		if !drifted.is_empty() {
			debug!(
				%resource_type,
				drifted = drifted.len(),
				"Synced resources drifted from the primary"
			);
		}

		let mut progress = self.progress.lock().await;
		let progress = progress.entry(resource_type).or_default();
		progress.drifted = drifted;
		progress.drift_checked_at = Some(Instant::now());

		Ok(())
	}

	/// Drifted entries nothing touched since, dropping the ones that moved on.
	async fn synced_with_drifted_checksum(
		&self,
		resource_type: ResourceType,
		batch_size: usize,
		excluded_ids: &HashSet<ResourceId>,
		found: &mut Vec<ResourceId>,
	) -> Result<(), FinderError> {
		let candidates = self
			.progress
			.lock()
			.await
			.get(&resource_type)
			.map(|progress| {
				progress
					.drifted
					.iter()
					.filter(|(id, _)| !excluded_ids.contains(id))
					.map(|(id, drifted)| (*id, drifted.clone()))
					.collect::<Vec<_>>()
			})
			.unwrap_or_default();

		if candidates.is_empty() {
			return Ok(());
		}

		let ids = candidates.iter().map(|(id, _)| *id).collect::<Vec<_>>();
		let current = self.registry.find_many(resource_type, &ids).await?;

		let mut moved_on = Vec::new();
		for (id, drifted) in candidates {
			if current
				.get(&id)
				.is_some_and(|entry| drifted.is_unchanged(entry))
			{
				if found.len() < batch_size {
					found.push(id);
				}
			} else {
				moved_on.push(id);
			}
		}

		if !moved_on.is_empty() {
			if let Some(progress) = self.progress.lock().await.get_mut(&resource_type) {
				for id in moved_on {
					progress.drifted.remove(&id);
				}
			}
		}

		Ok(())
	}
}

#[async_trait]
impl ResourceFinder for RegistryResourceFinder {
	#[instrument(skip(self, excluded_ids), fields(excluded = excluded_ids.len()), err)]
	async fn list_never_synced(
		&self,
		resource_type: ResourceType,
		batch_size: usize,
		excluded_ids: &HashSet<ResourceId>,
	) -> Result<Vec<ResourceId>, FinderError> {
		let mut found = Vec::new();
		if batch_size == 0 {
			return Ok(found);
		}

		// Entries still pending were created but never got through an attempt
		self.pending_on_primary(resource_type, batch_size, excluded_ids, &mut found)
			.await?;

		let mut unregistered = Vec::new();
		self.unregistered_on_primary(resource_type, batch_size, excluded_ids, &mut unregistered)
			.await?;

		found.extend(unregistered);
		found.sort_unstable();
		found.dedup();
		found.truncate(batch_size);

		trace!(found = found.len(), "Never synced resources");

		Ok(found)
	}

	#[instrument(skip(self, excluded_ids), fields(excluded = excluded_ids.len()), err)]
	async fn list_needing_resync(
		&self,
		resource_type: ResourceType,
		batch_size: usize,
		excluded_ids: &HashSet<ResourceId>,
	) -> Result<Vec<ResourceId>, FinderError> {
		let mut found = Vec::new();
		if batch_size == 0 {
			return Ok(found);
		}

		self.failed_with_retries_left(
			resource_type,
			batch_size,
			excluded_ids,
			Utc::now(),
			&mut found,
		)
		.await?;

		if found.len() < batch_size {
			self.refresh_drift(resource_type).await?;
			self.synced_with_drifted_checksum(resource_type, batch_size, excluded_ids, &mut found)
				.await?;
		}

		trace!(found = found.len(), "Resources needing resync");

		Ok(found)
	}

	#[instrument(skip(self, excluded_ids), fields(excluded = excluded_ids.len()), err)]
	async fn list_missing_on_primary(
		&self,
		resource_type: ResourceType,
		batch_size: usize,
		excluded_ids: &HashSet<ResourceId>,
	) -> Result<Vec<ResourceId>, FinderError> {
		let mut found = Vec::new();
		let page = page_size(batch_size);
		let now = Utc::now();
		let mut cursor = None;

		while found.len() < batch_size {
			let entries = self
				.registry
				.query_missing_on_primary(resource_type, page, cursor)
				.await?;

			let Some(last) = entries.last() else {
				break;
			};
			cursor = Some(last.resource_id);
			let exhausted = entries.len() < page;

			found.extend(
				entries
					.iter()
					.filter(|entry| {
						!excluded_ids.contains(&entry.resource_id)
							&& RetryPolicy::is_due_for_recheck(entry, now)
					})
					.map(|entry| entry.resource_id)
					.take(batch_size - found.len()),
			);

			if exhausted {
				break;
			}
		}

		trace!(found = found.len(), "Resources missing on primary");

		Ok(found)
	}

	async fn rescan(&self, resource_type: ResourceType) {
		if self.progress.lock().await.remove(&resource_type).is_some() {
			trace!(%resource_type, "Forgot scan progress");
		}
	}
}
