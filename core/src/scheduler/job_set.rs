use std::collections::HashSet;

use geo_registry::{ResourceId, ResourceType};
use tokio::sync::Mutex;

use crate::job_finder::JobDescriptor;

/// Jobs currently in flight, bounded by the global concurrency cap.
///
/// Shared between the dispatch loop, which inserts, and job completions, which remove.
#[derive(Debug)]
pub struct ScheduledJobSet {
	capacity: usize,
	jobs: Mutex<HashSet<JobDescriptor>>,
}

impl ScheduledJobSet {
	#[must_use]
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity,
			jobs: Mutex::new(HashSet::with_capacity(capacity)),
		}
	}

	#[must_use]
	pub const fn capacity(&self) -> usize {
		self.capacity
	}

	/// Adds a job unless it's already in flight or the set is full.
	pub async fn insert(&self, job: JobDescriptor) -> bool {
		let mut jobs = self.jobs.lock().await;

		if jobs.len() >= self.capacity {
			return false;
		}

		jobs.insert(job)
	}

	pub async fn remove(&self, job: &JobDescriptor) -> bool {
		self.jobs.lock().await.remove(job)
	}

	pub async fn contains(&self, job: &JobDescriptor) -> bool {
		self.jobs.lock().await.contains(job)
	}

	pub async fn len(&self) -> usize {
		self.jobs.lock().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.jobs.lock().await.is_empty()
	}

	pub async fn available_capacity(&self) -> usize {
		self.capacity.saturating_sub(self.len().await)
	}

	/// Ids in flight for one type, what its job finder must skip.
	pub async fn ids_for(&self, resource_type: ResourceType) -> HashSet<ResourceId> {
		self.jobs
			.lock()
			.await
			.iter()
			.filter(|job| job.resource_type == resource_type)
			.map(|job| job.resource_id)
			.collect()
	}

	/// Jobs in flight, ordered.
	pub async fn snapshot(&self) -> Vec<JobDescriptor> {
		let mut jobs = self.jobs.lock().await.iter().copied().collect::<Vec<_>>();
		jobs.sort_unstable();
		jobs
	}
}
