//! Garbage collection of registry entries whose resource the primary deleted.

use std::{collections::HashSet, fmt, sync::Arc};

use geo_registry::{RegistryStore, ResourceId, ResourceType};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::{
	catalog::PrimaryCatalog,
	finder::FinderError,
	replicator::{ReplicatorError, ReplicatorStrategy},
};

const PAGE_SIZE: usize = 500;

#[derive(Debug, Error)]
pub enum SweepError {
	#[error(transparent)]
	Storage(#[from] FinderError),
	#[error(transparent)]
	Replicator(#[from] ReplicatorError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
	pub checked: usize,
	pub deleted: usize,
}

/// Deletes registry entries, and their local copies, of resources the primary doesn't have
/// anymore.
pub struct ConsistencySweep {
	registry: Arc<dyn RegistryStore>,
	catalog: Arc<dyn PrimaryCatalog>,
	page_size: usize,
}

impl fmt::Debug for ConsistencySweep {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ConsistencySweep")
			.field("page_size", &self.page_size)
			.finish_non_exhaustive()
	}
}

impl ConsistencySweep {
	#[must_use]
	pub fn new(registry: Arc<dyn RegistryStore>, catalog: Arc<dyn PrimaryCatalog>) -> Self {
		Self {
			registry,
			catalog,
			page_size: PAGE_SIZE,
		}
	}

	#[must_use]
	pub fn with_page_size(mut self, page_size: usize) -> Self {
		self.page_size = page_size.max(1);
		self
	}

	/// Sweeps every entry of one type, leaving alone the ones in `in_flight`.
	///
	/// Cached lookups of the type are dropped first, a stale cache would keep deleted resources
	/// alive.
	#[instrument(skip(self, replicator, in_flight), fields(in_flight = in_flight.len()), err)]
	pub async fn sweep(
		&self,
		resource_type: ResourceType,
		replicator: &dyn ReplicatorStrategy,
		in_flight: &HashSet<ResourceId>,
	) -> Result<SweepReport, SweepError> {
		self.catalog.invalidate(resource_type).await;

		let mut report = SweepReport::default();
		let mut cursor = None;

		loop {
			let entries = self
				.registry
				.list(resource_type, self.page_size, cursor)
				.await
				.map_err(FinderError::from)?;

			let Some(last) = entries.last() else {
				break;
			};
			cursor = Some(last.resource_id);
			let exhausted = entries.len() < self.page_size;

			let ids = entries
				.iter()
				.map(|entry| entry.resource_id)
				.filter(|id| !in_flight.contains(id))
				.collect::<Vec<_>>();
			report.checked += ids.len();

			if !ids.is_empty() {
				let present = self
					.catalog
					.find_many(resource_type, &ids)
					.await
					.map_err(FinderError::from)?;

				for id in ids.into_iter().filter(|id| !present.contains_key(id)) {
					replicator.purge(id).await?;

					if self
						.registry
						.delete(resource_type, id)
						.await
						.map_err(FinderError::from)?
					{
						debug!(resource_id = %id, "Deleted entry of resource gone from primary");
						report.deleted += 1;
					}
				}
			}

			if exhausted {
				break;
			}
		}

		if report.deleted > 0 {
			info!(%resource_type, deleted = report.deleted, "Registry consistency sweep done");
		}

		Ok(report)
	}
}
