use std::{
	collections::HashMap,
	fmt,
	future::{Future, IntoFuture},
	pin::Pin,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	task::{Context, Poll},
	time::Duration,
};

use async_channel as chan;
use async_trait::async_trait;
use downcast_rs::{impl_downcast, Downcast};
use tokio::{
	sync::{oneshot, Mutex},
	task::AbortHandle,
};
use tracing::{instrument, trace, warn};
use uuid::Uuid;

use super::error::{RunError, SystemError};

/// A unique identifier for a task using the [`uuid`](https://docs.rs/uuid) crate.
pub type TaskId = Uuid;

/// A trait that represents any kind of output that a task can return.
///
/// The user will downcast it to the concrete type that the task returns.
pub trait AnyTaskOutput: Send + Downcast + 'static {}

impl fmt::Debug for Box<dyn AnyTaskOutput> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "<AnyTaskOutput>")
	}
}

impl_downcast!(AnyTaskOutput);

/// Blanket implementation for all types that implements `Send + 'static`
impl<T: Send + 'static> AnyTaskOutput for T {}

/// A helper trait to convert any type that implements [`AnyTaskOutput`] into a [`TaskOutput`], boxing it.
pub trait IntoAnyTaskOutput {
	fn into_output(self) -> TaskOutput;
}

impl<T: AnyTaskOutput + 'static> IntoAnyTaskOutput for T {
	fn into_output(self) -> TaskOutput {
		TaskOutput::Out(Box::new(self))
	}
}

/// Whether a task returned anything or not.
#[derive(Debug)]
pub enum TaskOutput {
	Out(Box<dyn AnyTaskOutput>),
	Empty,
}

impl From<()> for TaskOutput {
	fn from((): ()) -> Self {
		Self::Empty
	}
}

impl TaskOutput {
	/// Takes the concrete output back, if the task produced one of type `T`.
	#[must_use]
	pub fn downcast<T: AnyTaskOutput>(self) -> Option<T> {
		match self {
			Self::Out(out) => out.downcast::<T>().ok().map(|out| *out),
			Self::Empty => None,
		}
	}
}

/// All possible outcomes for a dispatched task.
#[derive(Debug)]
pub enum TaskStatus<E: RunError> {
	/// The task has finished successfully and maybe has some output for the user.
	Done((TaskId, TaskOutput)),
	/// Task was gracefully cancelled, either by its handle or by a system shutdown.
	Canceled,
	/// Task was forcefully aborted.
	ForcedAbortion,
	/// Task exceeded its [`Task::with_timeout`] and was dropped mid-run.
	TimedOut(TaskId),
	/// Task panicked, the worker that ran it keeps going.
	Panicked(TaskId),
	/// The system was shutdown before the task ever started, it never ran.
	Shutdown(TaskId),
	/// Task had an error so we return it back and the user can handle it appropriately.
	Error(E),
}

/// Whether the current [`Task::run`] finished its work or honored a cancel request.
#[derive(Debug)]
pub enum ExecStatus {
	Done(TaskOutput),
	Canceled,
}

/// A helper trait to convert any type that implements [`Task<E>`] into a [`Box<dyn Task<E>>`], boxing it.
pub trait IntoTask<E>: Send {
	fn into_task(self) -> Box<dyn Task<E>>;
}

impl<T: Task<E> + 'static, E: RunError> IntoTask<E> for T {
	fn into_task(self) -> Box<dyn Task<E>> {
		Box::new(self)
	}
}

/// The main trait that represents a task that can be dispatched to the task system.
///
/// All tasks dispatched to one system share the same error type.
#[async_trait]
pub trait Task<E: RunError>: Send + Sync + 'static {
	fn id(&self) -> TaskId;

	/// Upper bound on a single run. When it elapses the run future is dropped and the task
	/// resolves to [`TaskStatus::TimedOut`].
	fn with_timeout(&self) -> Option<Duration> {
		None
	}

	/// The work itself. The [`Interrupter`] tells the task when a cancel was requested, so it can
	/// stop at a point where no data is left half written.
	async fn run(&mut self, interrupter: &Interrupter) -> Result<ExecStatus, E>;
}


pin_project_lite::pin_project! {
	/// Waits until a cancel is requested for the running task.
	#[must_use = "`InterrupterFuture` does nothing unless polled"]
	pub struct InterrupterFuture<'recv> {
		#[pin]
		fut: chan::Recv<'recv, ()>,
		canceled: &'recv AtomicBool,
	}
}

impl Future for InterrupterFuture<'_> {
	type Output = ();

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let this = self.project();

		if this.canceled.load(Ordering::Acquire) {
			return Poll::Ready(());
		}

		match this.fut.poll(cx) {
			Poll::Ready(Ok(())) => {
				trace!("Running task received cancel request");
				this.canceled.store(true, Ordering::Release);
				Poll::Ready(())
			}
			Poll::Ready(Err(chan::RecvError)) => {
				// Nobody can send a cancel anymore, so the task runs freely until it ends
				warn!("Task interrupter channel closed, will run task until it finishes!");
				Poll::Pending
			}
			Poll::Pending => Poll::Pending,
		}
	}
}

impl<'recv> IntoFuture for &'recv Interrupter {
	type Output = ();

	type IntoFuture = InterrupterFuture<'recv>;

	fn into_future(self) -> Self::IntoFuture {
		InterrupterFuture {
			fut: self.cancel_rx.recv(),
			canceled: &self.canceled,
		}
	}
}

/// Lets a running task find out whether it should stop.
#[derive(Debug)]
pub struct Interrupter {
	cancel_rx: chan::Receiver<()>,
	canceled: AtomicBool,
	// Keeps the channel open for detached interrupters, nobody ever sends on it
	_never: Option<chan::Sender<()>>,
}

impl Interrupter {
	pub(crate) const fn new(cancel_rx: chan::Receiver<()>) -> Self {
		Self {
			cancel_rx,
			canceled: AtomicBool::new(false),
			_never: None,
		}
	}

	/// An interrupter that never fires, for running a task outside of the system.
	#[must_use]
	pub fn detached() -> Self {
		let (never_tx, cancel_rx) = chan::bounded(1);
		Self {
			_never: Some(never_tx),
			..Self::new(cancel_rx)
		}
	}

	/// Non-blocking check, once it returns `true` it keeps returning `true`.
	pub fn is_canceled(&self) -> bool {
		if self.canceled.load(Ordering::Acquire) {
			return true;
		}

		if self.cancel_rx.try_recv().is_ok() {
			trace!("Interrupter received cancel request");
			self.canceled.store(true, Ordering::Release);
			return true;
		}

		false
	}
}

#[derive(Debug)]
struct TaskSlot {
	cancel_tx: chan::Sender<()>,
	abort_handle: Option<AbortHandle>,
	force_abort: bool,
}

/// Book of every task that was dispatched and didn't finish yet.
#[derive(Debug, Default)]
pub(crate) struct Worktable {
	slots: Mutex<HashMap<TaskId, TaskSlot>>,
}

impl Worktable {
	pub async fn register(&self, task_id: TaskId, cancel_tx: chan::Sender<()>) {
		self.slots.lock().await.insert(
			task_id,
			TaskSlot {
				cancel_tx,
				abort_handle: None,
				force_abort: false,
			},
		);
	}

	/// Records the handle of a running task, aborting it right away if an abortion was
	/// requested in the meantime.
	pub async fn started(&self, task_id: TaskId, abort_handle: AbortHandle) {
		if let Some(slot) = self.slots.lock().await.get_mut(&task_id) {
			if slot.force_abort {
				abort_handle.abort();
			}

			slot.abort_handle = Some(abort_handle);
		}
	}

	pub async fn is_force_aborted(&self, task_id: TaskId) -> bool {
		self.slots
			.lock()
			.await
			.get(&task_id)
			.is_some_and(|slot| slot.force_abort)
	}

	pub async fn finish(&self, task_id: TaskId) {
		self.slots.lock().await.remove(&task_id);
	}

	pub async fn cancel(&self, task_id: TaskId) -> Result<(), SystemError> {
		let slots = self.slots.lock().await;
		let slot = slots
			.get(&task_id)
			.ok_or(SystemError::TaskNotFound(task_id))?;

		// A full channel means a cancel is already on its way
		if slot.cancel_tx.try_send(()).is_err() {
			trace!(%task_id, "Cancel already requested or task already finished");
		}

		Ok(())
	}

	pub async fn force_abort(&self, task_id: TaskId) -> Result<(), SystemError> {
		let mut slots = self.slots.lock().await;
		let slot = slots
			.get_mut(&task_id)
			.ok_or(SystemError::TaskNotFound(task_id))?;

		slot.force_abort = true;
		if let Some(abort_handle) = &slot.abort_handle {
			abort_handle.abort();
		}

		Ok(())
	}

	pub async fn cancel_all(&self) {
		for slot in self.slots.lock().await.values() {
			slot.cancel_tx.try_send(()).ok();
		}
	}

	pub async fn abort_all(&self) -> usize {
		let mut aborted = 0;

		for slot in self.slots.lock().await.values_mut() {
			slot.force_abort = true;
			if let Some(abort_handle) = &slot.abort_handle {
				abort_handle.abort();
				aborted += 1;
			}
		}

		aborted
	}

	pub async fn len(&self) -> usize {
		self.slots.lock().await.len()
	}
}

/// Handle to a dispatched task, await it to get the task's final [`TaskStatus`].
#[derive(Debug)]
pub struct TaskHandle<E: RunError> {
	pub(crate) task_id: TaskId,
	pub(crate) done_rx: oneshot::Receiver<TaskStatus<E>>,
	pub(crate) worktable: Arc<Worktable>,
}

impl<E: RunError> Future for TaskHandle<E> {
	type Output = Result<TaskStatus<E>, SystemError>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let task_id = self.task_id;

		Pin::new(&mut self.done_rx)
			.poll(cx)
			.map(|res| res.map_err(|_| SystemError::TaskDropped(task_id)))
	}
}

impl<E: RunError> TaskHandle<E> {
	#[must_use]
	pub const fn task_id(&self) -> TaskId {
		self.task_id
	}

	/// Asks the task to stop at its next safe point, see [`Interrupter`].
	#[instrument(skip(self), fields(task_id = %self.task_id))]
	pub async fn cancel(&self) -> Result<(), SystemError> {
		self.worktable.cancel(self.task_id).await
	}

	/// Forcefully abort the task, this can leave partial data behind, so use it with caution.
	#[instrument(skip(self), fields(task_id = %self.task_id))]
	pub async fn force_abortion(&self) -> Result<(), SystemError> {
		self.worktable.force_abort(self.task_id).await
	}
}
