use geo_task_system::{ExecStatus, Interrupter, IntoAnyTaskOutput, Task, TaskId, TaskOutput};

use std::{
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	},
	time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::sleep;
use tracing::info;

#[derive(Debug, Error)]
pub enum SampleError {
	#[error("Sample error")]
	SampleError,
}

#[derive(Debug)]
pub struct ReadyTask {
	id: TaskId,
	value: u64,
}

impl ReadyTask {
	pub fn new(value: u64) -> Self {
		Self {
			id: TaskId::new_v4(),
			value,
		}
	}
}

#[async_trait]
impl Task<SampleError> for ReadyTask {
	fn id(&self) -> TaskId {
		self.id
	}

	async fn run(&mut self, _interrupter: &Interrupter) -> Result<ExecStatus, SampleError> {
		Ok(ExecStatus::Done(self.value.into_output()))
	}
}

/// Only ends when canceled.
#[derive(Debug)]
pub struct NeverTask {
	id: TaskId,
}

impl Default for NeverTask {
	fn default() -> Self {
		Self {
			id: TaskId::new_v4(),
		}
	}
}

#[async_trait]
impl Task<SampleError> for NeverTask {
	fn id(&self) -> TaskId {
		self.id
	}

	async fn run(&mut self, interrupter: &Interrupter) -> Result<ExecStatus, SampleError> {
		interrupter.await;
		info!("Canceling NeverTask <id='{}'>", self.id);
		Ok(ExecStatus::Canceled)
	}
}

/// Ignores cancel requests, sleeping for as long as it was told to.
#[derive(Debug)]
pub struct StubbornTask {
	id: TaskId,
	duration: Duration,
	timeout: Option<Duration>,
}

impl StubbornTask {
	pub fn new(duration: Duration) -> Self {
		Self {
			id: TaskId::new_v4(),
			duration,
			timeout: None,
		}
	}

	pub const fn with_limit(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}
}

#[async_trait]
impl Task<SampleError> for StubbornTask {
	fn id(&self) -> TaskId {
		self.id
	}

	fn with_timeout(&self) -> Option<Duration> {
		self.timeout
	}

	async fn run(&mut self, _interrupter: &Interrupter) -> Result<ExecStatus, SampleError> {
		sleep(self.duration).await;
		Ok(ExecStatus::Done(TaskOutput::Empty))
	}
}

/// Tracks how many instances run at the same time.
#[derive(Debug)]
pub struct CountingTask {
	id: TaskId,
	running: Arc<AtomicUsize>,
	peak: Arc<AtomicUsize>,
}

impl CountingTask {
	pub fn new(running: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Self {
		Self {
			id: TaskId::new_v4(),
			running,
			peak,
		}
	}
}

#[async_trait]
impl Task<SampleError> for CountingTask {
	fn id(&self) -> TaskId {
		self.id
	}

	async fn run(&mut self, _interrupter: &Interrupter) -> Result<ExecStatus, SampleError> {
		let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
		self.peak.fetch_max(now_running, Ordering::SeqCst);
		sleep(Duration::from_millis(20)).await;
		self.running.fetch_sub(1, Ordering::SeqCst);
		Ok(ExecStatus::Done(TaskOutput::Empty))
	}
}

#[derive(Debug)]
pub struct BogusTask {
	id: TaskId,
}

impl Default for BogusTask {
	fn default() -> Self {
		Self {
			id: TaskId::new_v4(),
		}
	}
}

#[async_trait]
impl Task<SampleError> for BogusTask {
	fn id(&self) -> TaskId {
		self.id
	}

	async fn run(&mut self, _interrupter: &Interrupter) -> Result<ExecStatus, SampleError> {
		Err(SampleError::SampleError)
	}
}

#[derive(Debug)]
pub struct PanicTask {
	id: TaskId,
}

impl Default for PanicTask {
	fn default() -> Self {
		Self {
			id: TaskId::new_v4(),
		}
	}
}

#[async_trait]
impl Task<SampleError> for PanicTask {
	fn id(&self) -> TaskId {
		self.id
	}

	async fn run(&mut self, _interrupter: &Interrupter) -> Result<ExecStatus, SampleError> {
		panic!("PanicTask always panics");
	}
}
