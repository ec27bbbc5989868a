//!
//! # Geo Task System
//!
//! A bounded worker pool running the sync jobs of a secondary node.
//!
//! Bring your own error type and dispatch some tasks, the system takes care of queueing and
//! running them on a fixed number of workers, which is the global cap on concurrent work. Aside
//! from that it offers:
//! - Per task timeouts, reported as [`TaskStatus::TimedOut`];
//! - Graceful cancellation through the [`Interrupter`] every task receives;
//! - Forced abortion of tasks;
//! - Panics isolated to the task that panicked;
//! - A shutdown with a grace period, resolving queued tasks to [`TaskStatus::Shutdown`] and aborting
//!   what is still running once the grace period is over;
//!
//! ## Basic example
//!
//! ```
//! use geo_task_system::{ExecStatus, Interrupter, Task, TaskId, TaskOutput, TaskStatus, TaskSystem};
//! use async_trait::async_trait;
//! use thiserror::Error;
//! use std::time::Duration;
//!
//! #[derive(Debug, Error)]
//! pub enum SampleError {
//!     #[error("Sample error")]
//!     SampleError,
//! }
//!
//! #[derive(Debug)]
//! pub struct ReadyTask {
//!     id: TaskId,
//! }
//!
//! #[async_trait]
//! impl Task<SampleError> for ReadyTask {
//!     fn id(&self) -> TaskId {
//!         self.id
//!     }
//!
//!     async fn run(&mut self, _interrupter: &Interrupter) -> Result<ExecStatus, SampleError> {
//!         Ok(ExecStatus::Done(TaskOutput::Empty))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let system = TaskSystem::new(4);
//!
//!     let handle = system.dispatch(ReadyTask { id: TaskId::new_v4() }).await;
//!
//!     assert!(matches!(
//!         handle.await,
//!         Ok(TaskStatus::Done((_, TaskOutput::Empty)))
//!     ));
//!
//!     system.shutdown(Duration::from_secs(1)).await;
//! }
//! ```

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod error;
mod system;
mod task;

pub use error::{RunError, SystemError as TaskSystemError};
pub use system::{Dispatcher as TaskDispatcher, System as TaskSystem};
pub use task::{
	AnyTaskOutput, ExecStatus, Interrupter, InterrupterFuture, IntoAnyTaskOutput, IntoTask, Task,
	TaskHandle, TaskId, TaskOutput, TaskStatus,
};
