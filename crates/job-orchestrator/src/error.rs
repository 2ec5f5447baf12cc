use thiserror::Error;

use super::job::{JobId, JobStatus};

#[derive(Debug, Error)]
pub enum Error {
	#[error("job not found: {0}")]
	JobNotFound(JobId),
	#[error("invalid transition for job <id='{id}'>: expected '{expected}' -> '{to}', found '{found}'")]
	InvalidTransition {
		id: JobId,
		expected: JobStatus,
		found: JobStatus,
		to: JobStatus,
	},
	#[error("operation not valid for job <id='{id}'> in status '{status}'")]
	InvalidState { id: JobId, status: JobStatus },

	#[error("invalid orchestrator config: {0}")]
	Config(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why a job ended up `Failed`, rendered verbatim into `JobRecord::error_detail`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
	/// The executor returned an error, kept with its whole context chain.
	#[error("{0}")]
	Executor(String),
	#[error("executor panicked: {0}")]
	Panicked(String),
	/// The grace period elapsed before the executor acknowledged cancellation.
	/// The underlying task may still be alive.
	#[error("cancellation timeout")]
	CancellationTimeout,
}

impl FailureReason {
	pub fn from_executor(e: &anyhow::Error) -> Self {
		Self::Executor(format!("{e:#}"))
	}
}
