//! Per resource type strategies that bring one resource from the primary to this node.

use std::{collections::HashMap, fmt, io, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use geo_registry::{
	FailureKind, RegistryEntry, RegistryError, RegistryStore, ResourceId, ResourceType, SyncState,
	TransferKind,
};
use geo_task_system::Interrupter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::{fs::File, io::AsyncReadExt};
use tracing::{debug, warn};

use crate::{
	catalog::PrimaryCatalog,
	config::{GeoConfig, RetryBackoff},
};

mod blob;
mod repository;

pub use blob::{BlobDownload, BlobReplicator, BlobTransport, HttpBlobTransport};
pub use repository::{refs_digest, GitCliTransport, GitTransport, RepositoryReplicator};

/// Why fetching content from the primary failed.
#[derive(Debug, Error)]
pub enum TransportError {
	#[error("resource not found on the primary")]
	NotFound,
	#[error("primary answered HTTP {0}")]
	Status(u16),
	#[error("connection to the primary failed: {0}")]
	Connection(String),
	#[error("transfer timed out")]
	Timeout,
	#[error("local storage error: {0}")]
	Io(#[from] io::Error),
	#[error("git failed: {0}")]
	Git(String),
	#[error("sync attempt panicked")]
	Panicked,
}

impl From<reqwest::Error> for TransportError {
	fn from(e: reqwest::Error) -> Self {
		if e.is_timeout() {
			Self::Timeout
		} else if let Some(status) = e.status() {
			Self::Status(status.as_u16())
		} else {
			Self::Connection(e.to_string())
		}
	}
}

impl TransportError {
	const fn failure_kind(&self) -> FailureKind {
		match self {
			Self::Timeout => FailureKind::Timeout,
			_ => FailureKind::Transport,
		}
	}
}

/// Errors that keep a sync from even recording its outcome.
///
/// Transport problems aren't here, they are recorded on the registry entry instead.
#[derive(Debug, Error)]
pub enum ReplicatorError {
	#[error(transparent)]
	Registry(#[from] RegistryError),
	#[error("no replicator registered for resource type {0}")]
	UnknownType(ResourceType),
	#[error("failed to remove local copy of {resource_type}#{resource_id}: {source}")]
	Purge {
		resource_type: ResourceType,
		resource_id: ResourceId,
		#[source]
		source: io::Error,
	},
}

/// What a sync attempt recorded on the registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
	Synced { checksum: String },
	ChecksumMismatch { expected: String, actual: String },
	TransportFailed { reason: String, retry_count: u32 },
	MissingOnPrimary,
	/// The attempt was cancelled, the entry is back to how it was before.
	Interrupted,
}

/// Replicates resources of one type.
///
/// `sync` is safe to run concurrently for different ids, callers make sure the same id is never
/// synced twice at once.
#[async_trait]
pub trait ReplicatorStrategy: Send + Sync + 'static {
	fn resource_type(&self) -> ResourceType;

	async fn sync(
		&self,
		resource_id: ResourceId,
		interrupter: &Interrupter,
	) -> Result<SyncOutcome, ReplicatorError>;

	/// Removes the local copy of a resource the primary deleted.
	async fn purge(&self, resource_id: ResourceId) -> Result<(), ReplicatorError>;
}

/// Backoff knobs applied when recording failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
	pub backoff: RetryBackoff,
	pub missing_recheck: Duration,
}

impl SyncPolicy {
	#[must_use]
	pub const fn from_config(config: &GeoConfig) -> Self {
		Self {
			backoff: config.retry_backoff,
			missing_recheck: config.missing_recheck(),
		}
	}
}

/// Registry bookkeeping shared by every strategy.
#[derive(Clone)]
pub struct ReplicationContext {
	registry: Arc<dyn RegistryStore>,
	catalog: Arc<dyn PrimaryCatalog>,
	policy: SyncPolicy,
}

impl fmt::Debug for ReplicationContext {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ReplicationContext")
			.field("policy", &self.policy)
			.finish_non_exhaustive()
	}
}

/// A sync in progress, remembers the entry as it was so an interruption can put it back.
#[derive(Debug)]
pub(crate) struct Attempt {
	before: Option<RegistryEntry>,
	entry: RegistryEntry,
}

impl ReplicationContext {
	#[must_use]
	pub fn new(
		registry: Arc<dyn RegistryStore>,
		catalog: Arc<dyn PrimaryCatalog>,
		policy: SyncPolicy,
	) -> Self {
		Self {
			registry,
			catalog,
			policy,
		}
	}

	/// Marks the entry `started`, creating it first if this is the first attempt.
	pub(crate) async fn begin(
		&self,
		resource_type: ResourceType,
		resource_id: ResourceId,
	) -> Result<Attempt, ReplicatorError> {
		let before = self.registry.find(resource_type, resource_id).await?;

		let mut entry = before
			.clone()
			.unwrap_or_else(|| RegistryEntry::pending(resource_type, resource_id));
		entry.start();
		self.registry.upsert(&entry).await?;

		Ok(Attempt { before, entry })
	}

	/// The checksum the primary reports, `None` when it reports none or can't be reached.
	pub(crate) async fn expected_checksum(
		&self,
		resource_type: ResourceType,
		resource_id: ResourceId,
	) -> Option<String> {
		match self.catalog.find_many(resource_type, &[resource_id]).await {
			Ok(mut found) => found
				.remove(&resource_id)
				.and_then(|resource| resource.checksum),
			Err(e) => {
				warn!(%resource_type, %resource_id, ?e, "Couldn't get the primary's checksum");
				None
			}
		}
	}

	/// Records fetched content, checking it against the primary's checksum when there is one.
	pub(crate) async fn record_fetched(
		&self,
		mut attempt: Attempt,
		expected: Option<String>,
		actual: String,
	) -> Result<SyncOutcome, ReplicatorError> {
		let now = Utc::now();

		let outcome = match expected {
			Some(expected) if expected != actual => {
				warn!(
					resource_type = %attempt.entry.resource_type,
					resource_id = %attempt.entry.resource_id,
					%expected,
					%actual,
					"Checksum mismatch"
				);
				attempt.entry.fail_checksum_mismatch(
					format!("checksum mismatch: expected {expected}, got {actual}"),
					now,
				);
				SyncOutcome::ChecksumMismatch { expected, actual }
			}
			_ => {
				attempt.entry.succeed(actual.clone(), now);
				SyncOutcome::Synced { checksum: actual }
			}
		};

		self.registry.upsert(&attempt.entry).await?;

		Ok(outcome)
	}

	pub(crate) async fn record_transport_failure(
		&self,
		mut attempt: Attempt,
		error: &TransportError,
	) -> Result<SyncOutcome, ReplicatorError> {
		let now = Utc::now();
		let entry = &mut attempt.entry;

		let outcome = if matches!(error, TransportError::NotFound) && entry.previously_existed() {
			warn!(
				resource_type = %entry.resource_type,
				resource_id = %entry.resource_id,
				"Resource is missing on the primary"
			);
			entry.mark_missing_on_primary(now, self.policy.missing_recheck);
			SyncOutcome::MissingOnPrimary
		} else {
			debug!(
				resource_type = %entry.resource_type,
				resource_id = %entry.resource_id,
				%error,
				"Sync failed"
			);
			let backoff = self
				.policy
				.backoff
				.delay_for(entry.retry_count.saturating_add(1));
			entry.fail_transport(error.failure_kind(), error.to_string(), now, backoff);
			SyncOutcome::TransportFailed {
				reason: error.to_string(),
				retry_count: entry.retry_count,
			}
		};

		self.registry.upsert(entry).await?;

		Ok(outcome)
	}

	/// Puts the entry back to how it was before the attempt.
	pub(crate) async fn restore(&self, attempt: Attempt) -> Result<SyncOutcome, ReplicatorError> {
		match attempt.before {
			Some(before) => self.registry.upsert(&before).await?,
			None => {
				self.registry
					.delete(attempt.entry.resource_type, attempt.entry.resource_id)
					.await?;
			}
		}

		Ok(SyncOutcome::Interrupted)
	}

	/// Records a failure noticed outside of `sync`, like a run that timed out or panicked.
	pub async fn record_aborted_attempt(
		&self,
		resource_type: ResourceType,
		resource_id: ResourceId,
		error: &TransportError,
	) -> Result<(), ReplicatorError> {
		let before = self.registry.find(resource_type, resource_id).await?;
		let entry = before
			.clone()
			.unwrap_or_else(|| RegistryEntry::pending(resource_type, resource_id));

		self.record_transport_failure(Attempt { before, entry }, error)
			.await
			.map(|_| ())
	}

	/// Moves an attempt that was force aborted back to `pending`, like crash recovery does.
	pub async fn release_aborted_attempt(
		&self,
		resource_type: ResourceType,
		resource_id: ResourceId,
	) -> Result<(), ReplicatorError> {
		if let Some(mut entry) = self.registry.find(resource_type, resource_id).await? {
			if entry.state == SyncState::Started {
				entry.state = SyncState::Pending;
				self.registry.upsert(&entry).await?;
			}
		}

		Ok(())
	}
}

/// SHA-256 of a file, hex encoded.
pub(crate) async fn sha256_file(path: &Path) -> io::Result<String> {
	let mut file = File::open(path).await?;
	let mut hasher = Sha256::new();
	let mut buf = vec![0; 64 * 1024];

	loop {
		let read = file.read(&mut buf).await?;
		if read == 0 {
			break;
		}
		hasher.update(&buf[..read]);
	}

	Ok(hex::encode(hasher.finalize()))
}

/// The strategy of every replicated type.
#[derive(Clone, Default)]
pub struct ReplicatorSet {
	replicators: HashMap<ResourceType, Arc<dyn ReplicatorStrategy>>,
}

impl fmt::Debug for ReplicatorSet {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_set().entries(self.replicators.keys()).finish()
	}
}

impl ReplicatorSet {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Picks [`BlobReplicator`] or [`RepositoryReplicator`] for each type by its transfer kind.
	#[must_use]
	pub fn from_transports(
		resource_types: &[ResourceType],
		ctx: &ReplicationContext,
		storage_dir: &Path,
		blobs: &Arc<dyn BlobTransport>,
		git: &Arc<dyn GitTransport>,
	) -> Self {
		let mut set = Self::new();

		for resource_type in resource_types {
			let replicator: Arc<dyn ReplicatorStrategy> = match resource_type.transfer() {
				TransferKind::Blob => Arc::new(BlobReplicator::new(
					*resource_type,
					ctx.clone(),
					storage_dir,
					Arc::clone(blobs),
				)),
				TransferKind::Repository => Arc::new(RepositoryReplicator::new(
					*resource_type,
					ctx.clone(),
					storage_dir,
					Arc::clone(git),
				)),
			};

			set.insert(replicator);
		}

		set
	}

	/// Registers a strategy for its type, replacing any previous one.
	pub fn insert(&mut self, replicator: Arc<dyn ReplicatorStrategy>) {
		self.replicators
			.insert(replicator.resource_type(), replicator);
	}

	#[must_use]
	pub fn get(&self, resource_type: ResourceType) -> Option<Arc<dyn ReplicatorStrategy>> {
		self.replicators.get(&resource_type).cloned()
	}

	pub fn try_get(
		&self,
		resource_type: ResourceType,
	) -> Result<Arc<dyn ReplicatorStrategy>, ReplicatorError> {
		self.get(resource_type)
			.ok_or(ReplicatorError::UnknownType(resource_type))
	}
}
