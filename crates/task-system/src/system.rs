use std::{
	fmt,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};

use async_channel as chan;
use tokio::{
	spawn,
	sync::{oneshot, Mutex},
	task::JoinSet,
	time::{timeout, timeout_at, Instant},
};
use tracing::{debug, error, info, instrument, trace, warn};

use super::{
	error::RunError,
	task::{ExecStatus, Interrupter, IntoTask, Task, TaskHandle, TaskStatus, Worktable},
};

struct WorkItem<E: RunError> {
	task: Box<dyn Task<E>>,
	interrupter: Interrupter,
	done_tx: oneshot::Sender<TaskStatus<E>>,
}

/// A fixed size pool of workers, each running one task at a time.
///
/// The pool size is the hard cap on how many tasks run concurrently, extra tasks wait in a
/// shared queue and are picked up by whichever worker frees up first.
pub struct System<E: RunError> {
	workers_count: usize,
	dispatcher: Dispatcher<E>,
	workers: Mutex<Option<JoinSet<()>>>,
}

impl<E: RunError> fmt::Debug for System<E> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("System")
			.field("workers_count", &self.workers_count)
			.field("accepting", &self.dispatcher.is_accepting())
			.finish_non_exhaustive()
	}
}

impl<E: RunError> System<E> {
	/// Spawns `workers_count` workers on the current tokio runtime, at least one.
	#[must_use]
	pub fn new(workers_count: usize) -> Self {
		let workers_count = workers_count.max(1);
		let (tasks_tx, tasks_rx) = chan::unbounded();
		let worktable = Arc::new(Worktable::default());
		let accepting = Arc::new(AtomicBool::new(true));

		let mut workers = JoinSet::new();
		for worker_id in 0..workers_count {
			workers.spawn(work(
				worker_id,
				tasks_rx.clone(),
				Arc::clone(&worktable),
				Arc::clone(&accepting),
			));
		}

		info!(%workers_count, "Task system started");

		Self {
			workers_count,
			dispatcher: Dispatcher {
				tasks_tx,
				worktable,
				accepting,
			},
			workers: Mutex::new(Some(workers)),
		}
	}

	#[must_use]
	pub const fn workers_count(&self) -> usize {
		self.workers_count
	}

	/// Dispatches a task to the system, the task will be queued and run as soon as a worker is
	/// available.
	pub async fn dispatch(&self, into_task: impl IntoTask<E>) -> TaskHandle<E> {
		self.dispatcher.dispatch(into_task).await
	}

	/// Returns a cloneable dispatcher, for components that only need to send tasks.
	#[must_use]
	pub fn get_dispatcher(&self) -> Dispatcher<E> {
		self.dispatcher.clone()
	}

	/// Number of tasks dispatched that didn't report back yet, queued ones included.
	pub async fn pending_tasks(&self) -> usize {
		self.dispatcher.worktable.len().await
	}

	/// Stops accepting tasks, resolves queued ones to [`TaskStatus::Shutdown`] and asks the
	/// running ones to cancel. Tasks still running after `grace` are forcefully aborted.
	#[instrument(skip(self))]
	pub async fn shutdown(&self, grace: Duration) {
		let Some(mut workers) = self.workers.lock().await.take() else {
			debug!("Task system already shutdown");
			return;
		};

		self.dispatcher.accepting.store(false, Ordering::Release);
		self.dispatcher.tasks_tx.close();
		self.dispatcher.worktable.cancel_all().await;

		let deadline = Instant::now() + grace;

		loop {
			match timeout_at(deadline, workers.join_next()).await {
				Ok(Some(Ok(()))) => {}
				Ok(Some(Err(e))) => error!(?e, "Task system worker failed"),
				Ok(None) => break,
				Err(_) => {
					let aborted = self.dispatcher.worktable.abort_all().await;
					warn!(%aborted, "Grace period elapsed, forcing running tasks to abort");

					// Aborted tasks still report back, so workers end on their own shortly
					if timeout(grace.max(Duration::from_secs(1)), async {
						while let Some(res) = workers.join_next().await {
							if let Err(e) = res {
								error!(?e, "Task system worker failed");
							}
						}
					})
					.await
					.is_err()
					{
						error!("Workers didn't stop after aborting their tasks, dropping them");
						workers.abort_all();
					}

					break;
				}
			}
		}

		info!("Task system shutdown");
	}
}

/// Cheap cloneable entry point to a [`System`].
pub struct Dispatcher<E: RunError> {
	tasks_tx: chan::Sender<WorkItem<E>>,
	worktable: Arc<Worktable>,
	accepting: Arc<AtomicBool>,
}

impl<E: RunError> Clone for Dispatcher<E> {
	fn clone(&self) -> Self {
		Self {
			tasks_tx: self.tasks_tx.clone(),
			worktable: Arc::clone(&self.worktable),
			accepting: Arc::clone(&self.accepting),
		}
	}
}

impl<E: RunError> fmt::Debug for Dispatcher<E> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Dispatcher")
			.field("accepting", &self.is_accepting())
			.finish_non_exhaustive()
	}
}

impl<E: RunError> Dispatcher<E> {
	/// Whether the system is still taking new tasks.
	#[must_use]
	pub fn is_accepting(&self) -> bool {
		self.accepting.load(Ordering::Acquire) && !self.tasks_tx.is_closed()
	}

	/// Dispatches a task, after a shutdown the handle resolves right away to
	/// [`TaskStatus::Shutdown`].
	pub async fn dispatch(&self, into_task: impl IntoTask<E>) -> TaskHandle<E> {
		let task = into_task.into_task();
		let task_id = task.id();
		let (done_tx, done_rx) = oneshot::channel();

		let handle = TaskHandle {
			task_id,
			done_rx,
			worktable: Arc::clone(&self.worktable),
		};

		if !self.is_accepting() {
			trace!(%task_id, "Task system is shutting down, dropping task");
			done_tx.send(TaskStatus::Shutdown(task_id)).ok();
			return handle;
		}

		let (cancel_tx, cancel_rx) = chan::bounded(1);
		self.worktable.register(task_id, cancel_tx).await;

		// Unbounded channel, sending only fails once the system closed it
		if let Err(chan::SendError(WorkItem { done_tx, .. })) = self
			.tasks_tx
			.send(WorkItem {
				task,
				interrupter: Interrupter::new(cancel_rx),
				done_tx,
			})
			.await
		{
			self.worktable.finish(task_id).await;
			done_tx.send(TaskStatus::Shutdown(task_id)).ok();
		}

		handle
	}
}

async fn work<E: RunError>(
	worker_id: usize,
	tasks_rx: chan::Receiver<WorkItem<E>>,
	worktable: Arc<Worktable>,
	accepting: Arc<AtomicBool>,
) {
	trace!(%worker_id, "Worker started");

	while let Ok(WorkItem {
		mut task,
		interrupter,
		done_tx,
	}) = tasks_rx.recv().await
	{
		let task_id = task.id();

		if !accepting.load(Ordering::Acquire) || worktable.is_force_aborted(task_id).await {
			worktable.finish(task_id).await;
			let status = if accepting.load(Ordering::Acquire) {
				TaskStatus::ForcedAbortion
			} else {
				TaskStatus::Shutdown(task_id)
			};
			done_tx.send(status).ok();
			continue;
		}

		let run_timeout = task.with_timeout();

		let handle = spawn(async move {
			match run_timeout {
				Some(limit) => timeout(limit, task.run(&interrupter)).await.ok(),
				None => Some(task.run(&interrupter).await),
			}
		});

		worktable.started(task_id, handle.abort_handle()).await;

		let status = match handle.await {
			Ok(Some(Ok(ExecStatus::Done(out)))) => TaskStatus::Done((task_id, out)),
			Ok(Some(Ok(ExecStatus::Canceled))) => TaskStatus::Canceled,
			Ok(Some(Err(e))) => TaskStatus::Error(e),
			Ok(None) => {
				warn!(%task_id, "Task timed out");
				TaskStatus::TimedOut(task_id)
			}
			Err(e) if e.is_cancelled() => TaskStatus::ForcedAbortion,
			Err(e) => {
				error!(%task_id, ?e, "Task panicked");
				TaskStatus::Panicked(task_id)
			}
		};

		worktable.finish(task_id).await;

		if done_tx.send(status).is_err() {
			trace!(%task_id, "Task handle was dropped before the task finished");
		}
	}

	trace!(%worker_id, "Worker stopped");
}
