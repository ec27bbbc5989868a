//! The dispatch loop: turns job finder batches into sync jobs on a bounded worker pool.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_channel as chan;
use async_trait::async_trait;
use geo_registry::{RegistryEntry, RegistryError, RegistryStore, ResourceId, ResourceType};
use geo_task_system::{
	ExecStatus, Interrupter, IntoAnyTaskOutput, Task, TaskDispatcher, TaskHandle, TaskId,
	TaskStatus, TaskSystem,
};
use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;
use tokio::{
	sync::{watch, Mutex},
	task::JoinSet,
	time::{interval, interval_at, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use crate::{
	catalog::PrimaryCatalog,
	config::{ConfigError, GeoConfig},
	consistency::{ConsistencySweep, SweepReport},
	context::NodeContext,
	finder::{RegistryResourceFinder, ResourceFinder, RetryPolicy},
	job_finder::{JobDescriptor, JobFinder},
	replicator::{
		ReplicationContext, ReplicatorError, ReplicatorSet, ReplicatorStrategy, SyncOutcome,
		SyncPolicy, TransportError,
	},
	status::{GeoStatus, StatusCounter, TypeStatus},
};

mod job_set;

pub use job_set::ScheduledJobSet;

/// Pending out-of-cycle ticks, extra triggers beyond it are coalesced away.
const TRIGGER_QUEUE: usize = 64;

#[derive(Debug, Error)]
pub enum SchedulerError {
	/// The worker pool stopped taking jobs while the scheduler still runs, nothing can be synced
	/// anymore.
	#[error("worker pool is closed")]
	PoolClosed,
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error(transparent)]
	Registry(#[from] RegistryError),
	#[error(transparent)]
	Replicator(#[from] ReplicatorError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SchedulerState {
	Idle,
	Dispatching,
	Draining,
	Stopped,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
	pub scheduled: Vec<JobDescriptor>,
	/// Types whose finder failed, their sub-batch was skipped
	pub failed_types: Vec<ResourceType>,
	/// No capacity was left or the scheduler is draining, nothing was queried
	pub skipped: bool,
}

impl TickReport {
	fn skipped() -> Self {
		Self {
			skipped: true,
			..Default::default()
		}
	}
}

/// Splits `capacity` into `types` sub-budgets, the remainder going one by one to the first types.
#[must_use]
pub fn split_capacity(capacity: usize, types: usize) -> Vec<usize> {
	if types == 0 {
		return Vec::new();
	}

	let base = capacity / types;
	let remainder = capacity % types;

	(0..types)
		.map(|i| if i < remainder { base + 1 } else { base })
		.collect()
}

/// Runs one [`ReplicatorStrategy::sync`] on the worker pool.
struct SyncJob {
	id: TaskId,
	job: JobDescriptor,
	replicator: Arc<dyn ReplicatorStrategy>,
	timeout: Duration,
}

#[async_trait]
impl Task<ReplicatorError> for SyncJob {
	fn id(&self) -> TaskId {
		self.id
	}

	fn with_timeout(&self) -> Option<Duration> {
		Some(self.timeout)
	}

	async fn run(&mut self, interrupter: &Interrupter) -> Result<ExecStatus, ReplicatorError> {
		match self
			.replicator
			.sync(self.job.resource_id, interrupter)
			.await?
		{
			SyncOutcome::Interrupted => Ok(ExecStatus::Canceled),
			outcome => Ok(ExecStatus::Done(outcome.into_output())),
		}
	}
}

/// Bookkeeping run when a job reports back, whatever its fate.
#[derive(Clone)]
struct Completions {
	job_set: Arc<ScheduledJobSet>,
	replication: ReplicationContext,
	status: Arc<StatusCounter>,
}

impl Completions {
	async fn watch(self, job: JobDescriptor, handle: TaskHandle<ReplicatorError>) {
		let JobDescriptor {
			resource_type,
			resource_id,
		} = job;

		let recorded = match handle.await {
			Ok(TaskStatus::Done((_, out))) => {
				if let Some(outcome) = out.downcast::<SyncOutcome>() {
					trace!(%job, ?outcome, "Sync job done");
				}
				Ok(())
			}
			Ok(TaskStatus::Canceled) => {
				debug!(%job, "Sync job canceled");
				Ok(())
			}
			Ok(TaskStatus::TimedOut(_)) => {
				warn!(%job, "Sync job timed out");
				self.replication
					.record_aborted_attempt(resource_type, resource_id, &TransportError::Timeout)
					.await
			}
			Ok(TaskStatus::Panicked(_)) => {
				self.replication
					.record_aborted_attempt(resource_type, resource_id, &TransportError::Panicked)
					.await
			}
			Ok(TaskStatus::ForcedAbortion) => {
				warn!(%job, "Sync job was aborted");
				self.replication
					.release_aborted_attempt(resource_type, resource_id)
					.await
			}
			Ok(TaskStatus::Shutdown(_)) => {
				trace!(%job, "Sync job never started before shutdown");
				Ok(())
			}
			Ok(TaskStatus::Error(e)) => {
				// The outcome never reached the registry, the entry may still be `started`
				error!(%job, ?e, "Sync job failed");
				self.replication
					.release_aborted_attempt(resource_type, resource_id)
					.await
			}
			Err(e) => {
				error!(%job, ?e, "Lost track of sync job");
				self.replication
					.release_aborted_attempt(resource_type, resource_id)
					.await
			}
		};

		if let Err(e) = recorded {
			error!(%job, ?e, "Failed to record sync job result");
		}

		self.job_set.remove(&job).await;
		self.status.invalidate(resource_type).await;
	}
}

struct Inner {
	ctx: NodeContext,
	registry: Arc<dyn RegistryStore>,
	catalog: Arc<dyn PrimaryCatalog>,
	job_finders: Vec<JobFinder>,
	replicators: ReplicatorSet,
	timeouts: HashMap<ResourceType, Duration>,
	dispatch_interval: Duration,
	consistency_interval: Duration,
	drain_grace: Duration,
	system: TaskSystem<ReplicatorError>,
	dispatcher: TaskDispatcher<ReplicatorError>,
	completions: Completions,
	consistency: ConsistencySweep,
	tick_lock: Mutex<()>,
	state_tx: watch::Sender<SchedulerState>,
	trigger_tx: chan::Sender<Option<ResourceType>>,
	trigger_rx: chan::Receiver<Option<ResourceType>>,
	stop_tx: chan::Sender<()>,
	stop_rx: chan::Receiver<()>,
	watchers: Mutex<JoinSet<()>>,
}

/// Control loop of a secondary node.
///
/// Cheap to clone, every clone drives the same loop. Must be created inside a tokio runtime,
/// the worker pool is spawned right away.
#[derive(Clone)]
pub struct DispatchScheduler {
	inner: Arc<Inner>,
}

impl fmt::Debug for DispatchScheduler {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("DispatchScheduler")
			.field("node", &self.inner.ctx.name)
			.field("state", &self.state())
			.field("max_concurrency", &self.inner.completions.job_set.capacity())
			.finish_non_exhaustive()
	}
}

impl DispatchScheduler {
	/// Scheduler whose jobs are found by diffing `catalog` against `registry`.
	pub fn new(
		ctx: NodeContext,
		config: &GeoConfig,
		registry: Arc<dyn RegistryStore>,
		catalog: Arc<dyn PrimaryCatalog>,
		replicators: ReplicatorSet,
	) -> Result<Self, SchedulerError> {
		let finder = Arc::new(RegistryResourceFinder::new(
			Arc::clone(&registry),
			Arc::clone(&catalog),
			RetryPolicy {
				retry_ceiling: config.retry_ceiling,
			},
		));

		Self::with_finder(ctx, config, registry, catalog, finder, replicators)
	}

	/// Scheduler drawing its jobs from any [`ResourceFinder`].
	pub fn with_finder(
		ctx: NodeContext,
		config: &GeoConfig,
		registry: Arc<dyn RegistryStore>,
		catalog: Arc<dyn PrimaryCatalog>,
		finder: Arc<dyn ResourceFinder>,
		replicators: ReplicatorSet,
	) -> Result<Self, SchedulerError> {
		config.validate()?;

		for resource_type in &config.resource_types {
			replicators.try_get(*resource_type)?;
		}

		let job_finders = config
			.resource_types
			.iter()
			.map(|resource_type| JobFinder::new(*resource_type, Arc::clone(&finder)))
			.collect();

		let timeouts = config
			.resource_types
			.iter()
			.map(|resource_type| (*resource_type, config.timeout_for(*resource_type)))
			.collect();

		let system = TaskSystem::new(config.max_concurrency);
		let dispatcher = system.get_dispatcher();

		let completions = Completions {
			job_set: Arc::new(ScheduledJobSet::new(config.max_concurrency)),
			replication: ReplicationContext::new(
				Arc::clone(&registry),
				Arc::clone(&catalog),
				SyncPolicy::from_config(config),
			),
			status: Arc::new(StatusCounter::new(
				Arc::clone(&registry),
				config.retry_ceiling,
				config.status_cache_ttl(),
			)),
		};

		let (trigger_tx, trigger_rx) = chan::bounded(TRIGGER_QUEUE);
		let (stop_tx, stop_rx) = chan::bounded(1);

		Ok(Self {
			inner: Arc::new(Inner {
				consistency: ConsistencySweep::new(Arc::clone(&registry), Arc::clone(&catalog)),
				ctx,
				registry,
				catalog,
				job_finders,
				replicators,
				timeouts,
				dispatch_interval: config.dispatch_interval(),
				consistency_interval: config.consistency_interval(),
				drain_grace: config.drain_grace(),
				system,
				dispatcher,
				completions,
				tick_lock: Mutex::new(()),
				state_tx: watch::Sender::new(SchedulerState::Idle),
				trigger_tx,
				trigger_rx,
				stop_tx,
				stop_rx,
				watchers: Mutex::new(JoinSet::new()),
			}),
		})
	}

	#[must_use]
	pub fn context(&self) -> &NodeContext {
		&self.inner.ctx
	}

	#[must_use]
	pub fn state(&self) -> SchedulerState {
		*self.inner.state_tx.borrow()
	}

	/// Follows state changes.
	#[must_use]
	pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
		self.inner.state_tx.subscribe()
	}

	/// Jobs in flight, ordered.
	pub async fn in_flight(&self) -> Vec<JobDescriptor> {
		self.inner.completions.job_set.snapshot().await
	}

	fn resource_types(&self) -> impl Iterator<Item = ResourceType> + '_ {
		self.inner.job_finders.iter().map(JobFinder::resource_type)
	}

	fn job_finder(&self, resource_type: ResourceType) -> Option<&JobFinder> {
		self.inner
			.job_finders
			.iter()
			.find(|finder| finder.resource_type() == resource_type)
	}

	/// Moves entries left `started` by a previous run back to `pending`.
	///
	/// Only safe while nothing is in flight, [`Self::run`] calls it before its first tick.
	pub async fn recover_interrupted(&self) -> Result<u64, SchedulerError> {
		let mut recovered = 0;

		for resource_type in self.resource_types() {
			let reset = self.inner.registry.reset_started(resource_type).await?;
			if reset > 0 {
				info!(%resource_type, %reset, "Recovered interrupted sync attempts");
				self.inner.completions.status.invalidate(resource_type).await;
			}
			recovered += reset;
		}

		Ok(recovered)
	}

	/// One dispatch pass over every type, or only over `target`.
	#[instrument(skip(self), err)]
	pub async fn tick(&self, target: Option<ResourceType>) -> Result<TickReport, SchedulerError> {
		let _tick = self.inner.tick_lock.lock().await;

		if matches!(
			self.state(),
			SchedulerState::Draining | SchedulerState::Stopped
		) {
			return Ok(TickReport::skipped());
		}

		self.reap_watchers().await;

		let capacity = self.inner.completions.job_set.available_capacity().await;
		if capacity == 0 {
			debug!("Every worker is busy, skipping tick");
			return Ok(TickReport::skipped());
		}

		self.inner.state_tx.send_replace(SchedulerState::Dispatching);
		let res = self.dispatch(target, capacity).await;
		self.inner.state_tx.send_if_modified(|state| {
			if *state == SchedulerState::Dispatching {
				*state = SchedulerState::Idle;
				true
			} else {
				false
			}
		});

		res
	}

	async fn dispatch(
		&self,
		target: Option<ResourceType>,
		capacity: usize,
	) -> Result<TickReport, SchedulerError> {
		let job_set = &self.inner.completions.job_set;

		let finders = self
			.inner
			.job_finders
			.iter()
			.filter(|finder| target.map_or(true, |target| finder.resource_type() == target))
			.collect::<Vec<_>>();

		let mut report = TickReport::default();

		for (finder, budget) in finders
			.iter()
			.zip(split_capacity(capacity, finders.len()))
		{
			if budget == 0 {
				continue;
			}

			let resource_type = finder.resource_type();
			let excluded = job_set.ids_for(resource_type).await;

			match finder.find_jobs(budget, &excluded).await {
				Ok(jobs) => {
					for job in jobs {
						if self.schedule(job).await? {
							report.scheduled.push(job);
						}
					}
				}
				Err(e) => {
					warn!(%resource_type, ?e, "Skipping resource type for this tick");
					report.failed_types.push(resource_type);
				}
			}
		}

		if !report.scheduled.is_empty() {
			debug!(scheduled = report.scheduled.len(), "Dispatched sync jobs");
		}

		Ok(report)
	}

	async fn schedule(&self, job: JobDescriptor) -> Result<bool, SchedulerError> {
		let replicator = self.inner.replicators.try_get(job.resource_type)?;

		if !self.inner.dispatcher.is_accepting() {
			return Err(SchedulerError::PoolClosed);
		}

		if !self.inner.completions.job_set.insert(job).await {
			trace!(%job, "Already in flight");
			return Ok(false);
		}

		let handle = self
			.inner
			.dispatcher
			.dispatch(SyncJob {
				id: Uuid::new_v4(),
				job,
				replicator,
				timeout: self
					.inner
					.timeouts
					.get(&job.resource_type)
					.copied()
					.unwrap_or_else(|| job.resource_type.descriptor().default_timeout),
			})
			.await;

		self.inner
			.watchers
			.lock()
			.await
			.spawn(self.inner.completions.clone().watch(job, handle));

		Ok(true)
	}

	async fn reap_watchers(&self) {
		let mut watchers = self.inner.watchers.lock().await;

		while let Some(res) = watchers.try_join_next() {
			if let Err(e) = res {
				error!(?e, "Sync job watcher failed");
			}
		}
	}

	/// Asks for an out-of-cycle tick, for every type or only `target`.
	///
	/// A typed trigger means the primary has something new, so cached lookups of that type are
	/// dropped too.
	pub async fn trigger_dispatch(&self, target: Option<ResourceType>) {
		if let Some(resource_type) = target {
			self.inner.catalog.invalidate(resource_type).await;
			if let Some(finder) = self.job_finder(resource_type) {
				finder.rescan().await;
			}
		}

		if self.inner.trigger_tx.try_send(target).is_err() {
			trace!(?target, "Trigger queue is full, coalescing");
		}
	}

	/// Manual re-trigger of one resource, clearing a terminal failure.
	///
	/// Returns `false` when the resource is in flight and was left alone.
	pub async fn resync(
		&self,
		resource_type: ResourceType,
		resource_id: ResourceId,
	) -> Result<bool, SchedulerError> {
		if !self.resource_types().any(|known| known == resource_type) {
			return Err(ReplicatorError::UnknownType(resource_type).into());
		}

		let job = JobDescriptor::new(resource_type, resource_id);
		if self.inner.completions.job_set.contains(&job).await {
			return Ok(false);
		}

		let mut entry = self
			.inner
			.registry
			.find(resource_type, resource_id)
			.await?
			.unwrap_or_else(|| RegistryEntry::pending(resource_type, resource_id));
		entry.reset();
		self.inner.registry.upsert(&entry).await?;

		info!(%job, "Resync requested");

		self.inner.completions.status.invalidate(resource_type).await;
		self.trigger_dispatch(Some(resource_type)).await;

		Ok(true)
	}

	/// Sync health of every replicated type.
	pub async fn status(&self) -> Result<GeoStatus, SchedulerError> {
		let in_flight = self.in_flight().await;
		let mut types = Vec::with_capacity(self.inner.job_finders.len());

		for resource_type in self.resource_types() {
			types.push(TypeStatus {
				resource_type,
				counts: self.inner.completions.status.counts(resource_type).await?,
				in_flight: in_flight
					.iter()
					.filter(|job| job.resource_type == resource_type)
					.count(),
			});
		}

		Ok(GeoStatus {
			node: self.inner.ctx.name.to_string(),
			state: self.state(),
			in_flight: in_flight.len(),
			types,
		})
	}

	/// Runs a consistency sweep over every type, failures are logged and skip only their type.
	///
	/// Finders start over afterwards, picking up anything the primary added below ids they
	/// already went past.
	pub async fn sweep_consistency(&self) -> Vec<(ResourceType, SweepReport)> {
		let _tick = self.inner.tick_lock.lock().await;
		let mut reports = Vec::with_capacity(self.inner.job_finders.len());

		for finder in &self.inner.job_finders {
			finder.rescan().await;
		}

		for resource_type in self.resource_types() {
			let Some(replicator) = self.inner.replicators.get(resource_type) else {
				continue;
			};
			let in_flight = self.inner.completions.job_set.ids_for(resource_type).await;

			match self
				.inner
				.consistency
				.sweep(resource_type, replicator.as_ref(), &in_flight)
				.await
			{
				Ok(report) => {
					if report.deleted > 0 {
						self.inner.completions.status.invalidate(resource_type).await;
					}
					reports.push((resource_type, report));
				}
				Err(e) => warn!(%resource_type, ?e, "Consistency sweep failed"),
			}
		}

		reports
	}

	/// Drives the scheduler until [`Self::shutdown`] is called.
	///
	/// Only a closed worker pool or a registry failing at startup ends it with an error, the
	/// process can't make progress in either case.
	pub async fn run(&self) -> Result<(), SchedulerError> {
		self.recover_interrupted().await?;

		let mut dispatch = interval(self.inner.dispatch_interval);
		dispatch.set_missed_tick_behavior(MissedTickBehavior::Delay);

		let mut consistency = (!self.inner.consistency_interval.is_zero()).then(|| {
			let period = self.inner.consistency_interval;
			let mut consistency = interval_at(Instant::now() + period, period);
			consistency.set_missed_tick_behavior(MissedTickBehavior::Delay);
			consistency
		});

		info!(node = %self.inner.ctx.name, "Dispatch scheduler started");

		loop {
			tokio::select! {
				biased;

				_ = self.inner.stop_rx.recv() => break,

				_ = dispatch.tick() => {
					self.tick(None).await?;
				}

				Ok(target) = self.inner.trigger_rx.recv() => {
					let mut targets = vec![target];
					while let Ok(next) = self.inner.trigger_rx.try_recv() {
						targets.push(next);
					}

					if targets.contains(&None) {
						self.tick(None).await?;
					} else {
						targets.sort_unstable();
						targets.dedup();
						for target in targets {
							self.tick(target).await?;
						}
					}
				}

				() = next_sweep(&mut consistency) => {
					self.sweep_consistency().await;
				}
			}
		}

		info!("Dispatch scheduler loop stopped");

		Ok(())
	}

	/// Stops issuing jobs, cancels the ones in flight and waits for them up to the drain grace
	/// period before aborting the rest.
	#[instrument(skip(self))]
	pub async fn shutdown(&self) {
		if self.state() == SchedulerState::Stopped {
			return;
		}

		self.inner.state_tx.send_replace(SchedulerState::Draining);
		self.inner.stop_tx.close();

		let _tick = self.inner.tick_lock.lock().await;

		let in_flight = self.inner.completions.job_set.len().await;
		info!(%in_flight, grace = ?self.inner.drain_grace, "Draining sync jobs");

		self.inner.system.shutdown(self.inner.drain_grace).await;

		let mut watchers = std::mem::take(&mut *self.inner.watchers.lock().await);
		while let Some(res) = watchers.join_next().await {
			if let Err(e) = res {
				error!(?e, "Sync job watcher failed");
			}
		}

		self.inner.state_tx.send_replace(SchedulerState::Stopped);
		info!("Dispatch scheduler stopped");
	}
}

async fn next_sweep(consistency: &mut Option<Interval>) {
	match consistency {
		Some(consistency) => {
			consistency.tick().await;
		}
		None => std::future::pending().await,
	}
}
