use std::{error::Error as StdError, fmt};

use thiserror::Error;

use super::task::TaskId;

/// Bound every task error type must satisfy, so the system can carry it between threads.
pub trait RunError: StdError + fmt::Debug + Send + Sync + 'static {}

impl<T: StdError + fmt::Debug + Send + Sync + 'static> RunError for T {}

#[derive(Debug, Error)]
pub enum SystemError {
	#[error("task not found <id='{0}'>")]
	TaskNotFound(TaskId),
	#[error("task system dropped the task before it reported back <id='{0}'>")]
	TaskDropped(TaskId),
}
