use std::{collections::HashSet, fmt, sync::Arc};

use geo_registry::{ResourceId, ResourceType, ResourceTypeDescriptor};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::finder::{FinderError, ResourceFinder};

/// One unit of sync work, identifies a single resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobDescriptor {
	pub resource_type: ResourceType,
	pub resource_id: ResourceId,
}

impl JobDescriptor {
	#[must_use]
	pub const fn new(resource_type: ResourceType, resource_id: ResourceId) -> Self {
		Self {
			resource_type,
			resource_id,
		}
	}
}

impl fmt::Display for JobDescriptor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}#{}", self.resource_type, self.resource_id)
	}
}

/// Computes the next batch of jobs for one resource type.
///
/// The same struct serves every type, the descriptor tells it which one.
#[derive(Clone)]
pub struct JobFinder {
	descriptor: &'static ResourceTypeDescriptor,
	finder: Arc<dyn ResourceFinder>,
}

impl fmt::Debug for JobFinder {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("JobFinder")
			.field("resource_type", &self.descriptor.resource_type)
			.finish_non_exhaustive()
	}
}

impl JobFinder {
	#[must_use]
	pub fn new(resource_type: ResourceType, finder: Arc<dyn ResourceFinder>) -> Self {
		Self {
			descriptor: resource_type.descriptor(),
			finder,
		}
	}

	#[must_use]
	pub const fn resource_type(&self) -> ResourceType {
		self.descriptor.resource_type
	}

	/// Next batches are computed from scratch, see [`ResourceFinder::rescan`].
	pub async fn rescan(&self) {
		self.finder.rescan(self.descriptor.resource_type).await;
	}

	/// Up to `batch_size` jobs, drawn first from never synced resources, then from the ones
	/// needing a resync and last from the ones missing on the primary. None of them is in
	/// `excluded_ids` and none repeats.
	///
	/// Any query failing fails the whole batch.
	#[instrument(
		skip(self, excluded_ids),
		fields(resource_type = %self.descriptor.resource_type, excluded = excluded_ids.len()),
		err
	)]
	pub async fn find_jobs(
		&self,
		batch_size: usize,
		excluded_ids: &HashSet<ResourceId>,
	) -> Result<Vec<JobDescriptor>, FinderError> {
		let mut jobs = Vec::with_capacity(batch_size);
		if batch_size == 0 {
			return Ok(jobs);
		}

		let resource_type = self.descriptor.resource_type;
		let mut taken = excluded_ids.clone();

		let never_synced = self
			.finder
			.list_never_synced(resource_type, batch_size, &taken)
			.await?;
		let never_synced_count =
			push_new(&mut jobs, &mut taken, resource_type, never_synced, batch_size);

		let mut resync_count = 0;
		if jobs.len() < batch_size {
			let needing_resync = self
				.finder
				.list_needing_resync(resource_type, batch_size - jobs.len(), &taken)
				.await?;
			resync_count =
				push_new(&mut jobs, &mut taken, resource_type, needing_resync, batch_size);
		}

		let mut missing_count = 0;
		if jobs.len() < batch_size {
			let missing = self
				.finder
				.list_missing_on_primary(resource_type, batch_size - jobs.len(), &taken)
				.await?;
			missing_count = push_new(&mut jobs, &mut taken, resource_type, missing, batch_size);
		}

		debug!(
			never_synced = never_synced_count,
			needing_resync = resync_count,
			missing_on_primary = missing_count,
			"Found jobs"
		);

		Ok(jobs)
	}
}

fn push_new(
	jobs: &mut Vec<JobDescriptor>,
	taken: &mut HashSet<ResourceId>,
	resource_type: ResourceType,
	ids: Vec<ResourceId>,
	batch_size: usize,
) -> usize {
	let before = jobs.len();

	for id in ids {
		if jobs.len() >= batch_size {
			break;
		}

		if taken.insert(id) {
			jobs.push(JobDescriptor::new(resource_type, id));
		}
	}

	jobs.len() - before
}
