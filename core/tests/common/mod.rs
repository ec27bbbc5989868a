#![allow(dead_code)]

use std::{
	collections::HashMap,
	path::Path,
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use async_trait::async_trait;
use axum::Router;
use bytes::Bytes;
use futures::{stream, StreamExt};
use geo_core::{
	catalog::{InMemoryCatalog, PrimaryCatalog},
	config::RetryBackoff,
	replicator::{
		BlobDownload, BlobReplicator, BlobTransport, ReplicationContext, ReplicatorError,
		ReplicatorSet, ReplicatorStrategy, SyncOutcome, SyncPolicy, TransportError,
	},
	DispatchScheduler, GeoConfig, NodeContext, RegistryBackend,
};
use geo_registry::{
	InMemoryRegistry, RegistryEntry, RegistryError, RegistryStore, ResourceId, ResourceType,
	StateCounts, SyncState,
};
use geo_task_system::Interrupter;
use tempfile::TempDir;
use tokio::{net::TcpListener, sync::oneshot, time::sleep};
use url::Url;

/// Config rooted in `dir` replicating `resource_types`, with retries that never back off.
pub fn config(dir: &Path, max_concurrency: usize, resource_types: &[ResourceType]) -> GeoConfig {
	let mut config = GeoConfig::default_with_dir(dir.to_path_buf());
	config.max_concurrency = max_concurrency;
	config.resource_types = resource_types.to_vec();
	config.retry_backoff = RetryBackoff {
		base_seconds: 0,
		max_seconds: 0,
	};
	config.drain_grace_seconds = 1;
	config.registry = RegistryBackend::Memory;
	config
}

pub fn node(primary_url: Url, storage_dir: &Path) -> NodeContext {
	NodeContext::new("test-secondary", primary_url, None, storage_dir.to_path_buf())
		.expect("http client builds")
}

/// Registry and catalog of one simulated secondary, both in memory.
pub struct Fixture {
	pub dir: TempDir,
	pub registry: InMemoryRegistry,
	pub catalog: InMemoryCatalog,
}

impl Fixture {
	pub fn new() -> Self {
		Self {
			dir: tempfile::tempdir().expect("temp dir"),
			registry: InMemoryRegistry::new(),
			catalog: InMemoryCatalog::new(),
		}
	}

	pub fn path(&self) -> &Path {
		self.dir.path()
	}

	pub fn registry(&self) -> Arc<dyn RegistryStore> {
		Arc::new(self.registry.clone())
	}

	pub fn catalog(&self) -> Arc<dyn PrimaryCatalog> {
		Arc::new(self.catalog.clone())
	}

	pub fn node(&self) -> NodeContext {
		node(
			Url::parse("http://127.0.0.1:9").expect("valid url"),
			&self.path().join("storage"),
		)
	}

	pub fn replication(&self, config: &GeoConfig) -> ReplicationContext {
		ReplicationContext::new(self.registry(), self.catalog(), SyncPolicy::from_config(config))
	}

	pub async fn add_primary(
		&self,
		resource_type: ResourceType,
		ids: impl IntoIterator<Item = ResourceId>,
	) {
		for id in ids {
			self.catalog.insert(resource_type, id, Some("checksum")).await;
		}
	}

	pub async fn entry(
		&self,
		resource_type: ResourceType,
		id: ResourceId,
	) -> Option<RegistryEntry> {
		self.registry
			.find(resource_type, id)
			.await
			.expect("in memory registry never fails")
	}

	/// Scheduler and blob replicators of every type in `config`, all writing through `registry`.
	pub fn scheduler_over(
		&self,
		config: &GeoConfig,
		registry: Arc<dyn RegistryStore>,
		transport: Arc<dyn BlobTransport>,
	) -> DispatchScheduler {
		let ctx = ReplicationContext::new(
			Arc::clone(&registry),
			self.catalog(),
			SyncPolicy::from_config(config),
		);
		let storage_dir = config.storage_dir();
		let mut replicators = ReplicatorSet::new();

		for resource_type in &config.resource_types {
			replicators.insert(Arc::new(BlobReplicator::new(
				*resource_type,
				ctx.clone(),
				&storage_dir,
				Arc::clone(&transport),
			)));
		}

		DispatchScheduler::new(self.node(), config, registry, self.catalog(), replicators)
			.expect("valid scheduler setup")
	}

	pub fn scheduler(&self, config: &GeoConfig, replicators: ReplicatorSet) -> DispatchScheduler {
		DispatchScheduler::new(
			self.node(),
			config,
			self.registry(),
			self.catalog(),
			replicators,
		)
		.expect("valid scheduler setup")
	}

	/// Blob replicators of every type in `config` going through `transport`.
	pub fn blob_replicators(
		&self,
		config: &GeoConfig,
		transport: Arc<dyn BlobTransport>,
	) -> ReplicatorSet {
		let ctx = self.replication(config);
		let storage_dir = config.storage_dir();
		let mut set = ReplicatorSet::new();

		for resource_type in &config.resource_types {
			set.insert(Arc::new(BlobReplicator::new(
				*resource_type,
				ctx.clone(),
				&storage_dir,
				Arc::clone(&transport),
			)));
		}

		set
	}
}

/// In memory registry whose writes of sync outcomes can be made to fail, like a database that is
/// locked right when a job finishes.
#[derive(Debug, Clone)]
pub struct LockedRegistry {
	inner: InMemoryRegistry,
	failing_outcomes: Arc<AtomicUsize>,
}

impl LockedRegistry {
	pub fn new(inner: InMemoryRegistry) -> Self {
		Self {
			inner,
			failing_outcomes: Arc::default(),
		}
	}

	/// The next `count` writes of anything but a `started` entry fail.
	pub fn fail_outcomes(&self, count: usize) {
		self.failing_outcomes.store(count, Ordering::Release);
	}
}

#[async_trait]
impl RegistryStore for LockedRegistry {
	async fn find(
		&self,
		resource_type: ResourceType,
		resource_id: ResourceId,
	) -> Result<Option<RegistryEntry>, RegistryError> {
		self.inner.find(resource_type, resource_id).await
	}

	async fn find_many(
		&self,
		resource_type: ResourceType,
		resource_ids: &[ResourceId],
	) -> Result<HashMap<ResourceId, RegistryEntry>, RegistryError> {
		self.inner.find_many(resource_type, resource_ids).await
	}

	async fn upsert(&self, entry: &RegistryEntry) -> Result<(), RegistryError> {
		if entry.state != SyncState::Started
			&& self
				.failing_outcomes
				.fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
				.is_ok()
		{
			return Err(RegistryError::Unavailable("database is locked".to_string()));
		}

		self.inner.upsert(entry).await
	}

	async fn query_by_state(
		&self,
		resource_type: ResourceType,
		state: SyncState,
		limit: usize,
		offset_after: Option<ResourceId>,
	) -> Result<Vec<RegistryEntry>, RegistryError> {
		self.inner
			.query_by_state(resource_type, state, limit, offset_after)
			.await
	}

	async fn query_missing_on_primary(
		&self,
		resource_type: ResourceType,
		limit: usize,
		offset_after: Option<ResourceId>,
	) -> Result<Vec<RegistryEntry>, RegistryError> {
		self.inner
			.query_missing_on_primary(resource_type, limit, offset_after)
			.await
	}

	async fn list(
		&self,
		resource_type: ResourceType,
		limit: usize,
		offset_after: Option<ResourceId>,
	) -> Result<Vec<RegistryEntry>, RegistryError> {
		self.inner.list(resource_type, limit, offset_after).await
	}

	async fn delete(
		&self,
		resource_type: ResourceType,
		resource_id: ResourceId,
	) -> Result<bool, RegistryError> {
		self.inner.delete(resource_type, resource_id).await
	}

	async fn counts(
		&self,
		resource_type: ResourceType,
		retry_ceiling: u32,
	) -> Result<StateCounts, RegistryError> {
		self.inner.counts(resource_type, retry_ceiling).await
	}

	async fn reset_started(&self, resource_type: ResourceType) -> Result<u64, RegistryError> {
		self.inner.reset_started(resource_type).await
	}
}

/// Holds every sync until it's canceled, keeping its job in flight.
#[derive(Debug)]
pub struct BlockingReplicator {
	resource_type: ResourceType,
	pub started: Arc<Mutex<Vec<ResourceId>>>,
}

impl BlockingReplicator {
	pub fn new(resource_type: ResourceType) -> Self {
		Self {
			resource_type,
			started: Arc::default(),
		}
	}

	pub fn set(resource_types: &[ResourceType]) -> ReplicatorSet {
		let mut set = ReplicatorSet::new();
		for resource_type in resource_types {
			set.insert(Arc::new(Self::new(*resource_type)));
		}
		set
	}
}

#[async_trait]
impl ReplicatorStrategy for BlockingReplicator {
	fn resource_type(&self) -> ResourceType {
		self.resource_type
	}

	async fn sync(
		&self,
		resource_id: ResourceId,
		interrupter: &Interrupter,
	) -> Result<SyncOutcome, ReplicatorError> {
		self.started
			.lock()
			.expect("not poisoned")
			.push(resource_id);

		interrupter.await;

		Ok(SyncOutcome::Interrupted)
	}

	async fn purge(&self, _resource_id: ResourceId) -> Result<(), ReplicatorError> {
		Ok(())
	}
}

/// Every download fails as if the primary refused the connection.
#[derive(Debug, Default)]
pub struct RefusingTransport;

#[async_trait]
impl BlobTransport for RefusingTransport {
	async fn open(
		&self,
		_resource_type: ResourceType,
		_resource_id: ResourceId,
		_offset: u64,
	) -> Result<BlobDownload, TransportError> {
		Err(TransportError::Connection("connection refused".to_string()))
	}
}

/// Sends a first chunk and then stalls forever.
#[derive(Debug, Default)]
pub struct StallingTransport;

#[async_trait]
impl BlobTransport for StallingTransport {
	async fn open(
		&self,
		_resource_type: ResourceType,
		_resource_id: ResourceId,
		_offset: u64,
	) -> Result<BlobDownload, TransportError> {
		Ok(BlobDownload {
			resumed: false,
			body: stream::once(async { Ok(Bytes::from_static(b"partial")) })
				.chain(stream::pending())
				.boxed(),
		})
	}
}

/// Serves `router` on a random local port until dropped.
pub struct TestServer {
	pub base_url: Url,
	shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestServer {
	pub async fn new(router: Router) -> Self {
		let listener = TcpListener::bind("127.0.0.1:0")
			.await
			.expect("bind test listener");
		let addr = listener.local_addr().expect("listener address");

		let (shutdown_tx, shutdown_rx) = oneshot::channel();
		let server = axum::serve(listener, router).with_graceful_shutdown(async {
			shutdown_rx.await.ok();
		});

		tokio::spawn(async move {
			server.await.expect("run test server");
		});

		sleep(Duration::from_millis(100)).await;

		Self {
			base_url: Url::parse(&format!("http://{addr}")).expect("valid url"),
			shutdown_tx: Some(shutdown_tx),
		}
	}
}

impl Drop for TestServer {
	fn drop(&mut self) {
		if let Some(shutdown_tx) = self.shutdown_tx.take() {
			shutdown_tx.send(()).ok();
		}
	}
}

/// Waits until nothing is in flight anymore.
pub async fn wait_until_idle(scheduler: &DispatchScheduler) {
	tokio::time::timeout(Duration::from_secs(10), async {
		while !scheduler.in_flight().await.is_empty() {
			sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.expect("jobs didn't complete in time");
}

/// Waits until `count` jobs are in flight.
pub async fn wait_for_in_flight(scheduler: &DispatchScheduler, count: usize) {
	tokio::time::timeout(Duration::from_secs(10), async {
		while scheduler.in_flight().await.len() < count {
			sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.expect("jobs weren't dispatched in time");
}

/// Waits until the entry of a resource satisfies `done`.
pub async fn wait_for_entry(
	fixture: &Fixture,
	resource_type: ResourceType,
	id: ResourceId,
	done: impl Fn(&RegistryEntry) -> bool,
) -> RegistryEntry {
	tokio::time::timeout(Duration::from_secs(10), async {
		loop {
			if let Some(entry) = fixture.entry(resource_type, id).await {
				if done(&entry) {
					return entry;
				}
			}
			sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.expect("entry didn't reach the expected state in time")
}
