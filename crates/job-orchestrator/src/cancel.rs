use std::{
	collections::HashMap,
	future::{Future, IntoFuture},
	pin::Pin,
	sync::{Arc, Mutex, PoisonError},
	task::{Context, Poll},
	time::Duration,
};

use tokio::{sync::watch, task::AbortHandle, time::timeout};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{instrument, trace, warn};

use super::{
	broadcast::ProgressBroadcaster,
	config::CancelTimeoutPolicy,
	error::{Error, FailureReason, Result},
	job::{JobId, JobStatus, Termination},
	registry::JobRegistry,
};

pin_project_lite::pin_project! {
	/// Resolves once the job owning the [`Interrupter`] was asked to stop.
	#[must_use = "`InterrupterFuture` does nothing unless polled"]
	pub struct InterrupterFuture<'token> {
		#[pin]
		fut: WaitForCancellationFuture<'token>,
	}
}

impl Future for InterrupterFuture<'_> {
	type Output = ();

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let this = self.project();

		match this.fut.poll(cx) {
			Poll::Ready(()) => {
				trace!("Running executor received cancellation request");
				Poll::Ready(())
			}
			Poll::Pending => Poll::Pending,
		}
	}
}

/// We use an [`IntoFuture`] implementation to allow executors to `.await` the [`Interrupter`]
/// directly, usually as one branch of a `tokio::select!`.
impl<'token> IntoFuture for &'token Interrupter {
	type Output = ();

	type IntoFuture = InterrupterFuture<'token>;

	fn into_future(self) -> Self::IntoFuture {
		InterrupterFuture {
			fut: self.token.cancelled(),
		}
	}
}

/// Handed to every executor so it can notice, at a point of its choosing, that its job was
/// asked to stop. The engine never preempts an executor, it has to check this at every
/// blocking or long-running step.
#[derive(Debug, Clone)]
pub struct Interrupter {
	token: CancellationToken,
}

impl Interrupter {
	pub(crate) const fn new(token: CancellationToken) -> Self {
		Self { token }
	}

	/// Non-blocking check for a cancellation request
	#[must_use]
	pub fn is_interrupted(&self) -> bool {
		self.token.is_cancelled()
	}

	/// A child token, cancelled along with the job, for handing to libraries that take
	/// a `CancellationToken` themselves
	#[must_use]
	pub fn child_token(&self) -> CancellationToken {
		self.token.child_token()
	}
}

/// Returns `Ok(ExecStatus::Canceled)` from the enclosing executor if its job was asked to stop.
#[macro_export]
macro_rules! check_interruption {
	($interrupter:expr) => {
		let interrupter: &$crate::Interrupter = $interrupter;

		if interrupter.is_interrupted() {
			::tracing::trace!("Executor was canceled by the user");
			return Ok($crate::ExecStatus::Canceled);
		}
	};
}

/// What a stop request ended up doing to the job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
	/// The executor acknowledged the cancellation within the grace period
	Cancelled,
	/// The executor finished its work before the cancellation took effect
	CompletedFirst,
	/// The executor errored while tearing down
	FailedDuringStop(String),
	/// The grace period elapsed, the job was failed with a cancellation timeout.
	/// Unless `aborted`, the underlying task may still be running and the caller must
	/// apply a stronger kill if that matters.
	TimedOut { aborted: bool },
	/// Another stop request already won the latch, nothing was done
	AlreadyStopping,
	/// The job had already reached this terminal status
	AlreadyFinished(JobStatus),
}

impl StopOutcome {
	fn from_terminal(status: JobStatus, error_detail: Option<String>) -> Self {
		match status {
			JobStatus::Completed => Self::CompletedFirst,
			JobStatus::Failed => Self::FailedDuringStop(error_detail.unwrap_or_default()),
			_ => Self::Cancelled,
		}
	}
}

#[derive(Debug)]
struct JobControl {
	token: CancellationToken,
	done_rx: watch::Receiver<bool>,
	abort_handle: Option<AbortHandle>,
}

/// Signals the coordinator that the executor of a job is gone, when dropped.
///
/// Lives inside the executor's task, so an aborted or panicked task still releases
/// anyone waiting on a cancellation.
#[derive(Debug)]
pub(crate) struct ExecutionGuard {
	job_id: JobId,
	done_tx: watch::Sender<bool>,
	controls: Arc<Mutex<HashMap<JobId, JobControl>>>,
}

impl Drop for ExecutionGuard {
	fn drop(&mut self) {
		self.controls
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(&self.job_id);

		self.done_tx.send_replace(true);
	}
}

/// Turns stop requests into cooperative cancellation of running executors, bounded by a
/// grace period, and makes sure no job stays `Stopping` forever.
#[derive(Debug, Clone)]
pub struct CancellationCoordinator {
	registry: JobRegistry,
	broadcaster: ProgressBroadcaster,
	controls: Arc<Mutex<HashMap<JobId, JobControl>>>,
	policy: CancelTimeoutPolicy,
}

impl CancellationCoordinator {
	#[must_use]
	pub fn new(
		registry: JobRegistry,
		broadcaster: ProgressBroadcaster,
		policy: CancelTimeoutPolicy,
	) -> Self {
		Self {
			registry,
			broadcaster,
			controls: Arc::default(),
			policy,
		}
	}

	/// Binds a cancellation token to `job_id`, returning the executor side of it
	pub(crate) fn register(&self, job_id: JobId) -> (Interrupter, ExecutionGuard) {
		let token = CancellationToken::new();
		let (done_tx, done_rx) = watch::channel(false);

		self.lock_controls().insert(
			job_id,
			JobControl {
				token: token.clone(),
				done_rx,
				abort_handle: None,
			},
		);

		(
			Interrupter::new(token),
			ExecutionGuard {
				job_id,
				done_tx,
				controls: Arc::clone(&self.controls),
			},
		)
	}

	pub(crate) fn attach_abort_handle(&self, job_id: JobId, abort_handle: AbortHandle) {
		if let Some(control) = self.lock_controls().get_mut(&job_id) {
			control.abort_handle = Some(abort_handle);
		}
	}

	/// Whether an executor is still attached to `job_id`
	#[must_use]
	pub fn is_executing(&self, job_id: JobId) -> bool {
		self.lock_controls().contains_key(&job_id)
	}

	/// Requests cancellation of a `Running` job and waits up to `grace_period` for its
	/// executor to acknowledge it.
	///
	/// Idempotent: once a request won the latch, further calls return
	/// [`StopOutcome::AlreadyStopping`] right away. Jobs in any status other than
	/// `Running` or `Stopping` yield [`Error::InvalidState`].
	#[instrument(skip(self), fields(%job_id), err)]
	pub async fn cancel(&self, job_id: JobId, grace_period: Duration) -> Result<StopOutcome> {
		let record = match self.registry.request_cancel(job_id) {
			Ok(record) => record,
			Err(Error::InvalidTransition {
				found: JobStatus::Stopping,
				..
			}) => {
				trace!("Cancellation already requested");
				return Ok(StopOutcome::AlreadyStopping);
			}
			Err(Error::InvalidTransition { found, .. }) => {
				return Err(Error::InvalidState {
					id: job_id,
					status: found,
				});
			}
			Err(e) => return Err(e),
		};

		self.broadcaster.announce_stopping(&record);

		let control = self
			.lock_controls()
			.get(&job_id)
			.map(|control| (control.token.clone(), control.done_rx.clone()));

		let Some((token, mut done_rx)) = control else {
			trace!("No executor attached, cancelling right away");
			return self.settle(job_id, Termination::Cancelled);
		};

		token.cancel();

		if timeout(grace_period, done_rx.wait_for(|done| *done))
			.await
			.is_ok()
		{
			let record = self
				.registry
				.get(job_id)
				.ok_or(Error::JobNotFound(job_id))?;

			return if record.status == JobStatus::Stopping {
				// The executor went away without reporting anything
				self.settle(job_id, Termination::Cancelled)
			} else {
				Ok(StopOutcome::from_terminal(
					record.status,
					record.error_detail,
				))
			};
		}

		warn!(
			?grace_period,
			"Executor did not acknowledge cancellation in time"
		);

		match self.registry.finish(
			job_id,
			JobStatus::Stopping,
			Termination::Failed(FailureReason::CancellationTimeout.to_string()),
		) {
			Ok(record) => {
				self.broadcaster.finish(&record);
				Ok(StopOutcome::TimedOut {
					aborted: self.apply_timeout_policy(job_id),
				})
			}
			// The executor landed right on the deadline
			Err(Error::InvalidTransition { found, .. }) if found.is_terminal() => {
				let error_detail = self
					.registry
					.get(job_id)
					.and_then(|record| record.error_detail);
				Ok(StopOutcome::from_terminal(found, error_detail))
			}
			Err(e) => Err(e),
		}
	}

	fn settle(&self, job_id: JobId, termination: Termination) -> Result<StopOutcome> {
		match self.registry.finish(job_id, JobStatus::Stopping, termination) {
			Ok(record) => {
				self.broadcaster.finish(&record);
				Ok(StopOutcome::from_terminal(
					record.status,
					record.error_detail,
				))
			}
			Err(Error::InvalidTransition { found, .. }) if found.is_terminal() => {
				let error_detail = self
					.registry
					.get(job_id)
					.and_then(|record| record.error_detail);
				Ok(StopOutcome::from_terminal(found, error_detail))
			}
			Err(e) => Err(e),
		}
	}

	fn apply_timeout_policy(&self, job_id: JobId) -> bool {
		match self.policy {
			CancelTimeoutPolicy::Detach => {
				warn!(%job_id, "Leaving unresponsive executor detached, its late result will be ignored");
				false
			}
			CancelTimeoutPolicy::Abort => {
				// Aborting drops the task's guard, which takes the controls lock
				let abort_handle = self
					.lock_controls()
					.get_mut(&job_id)
					.and_then(|control| control.abort_handle.take());

				abort_handle.map_or(false, |abort_handle| {
					warn!(%job_id, "Aborting unresponsive executor task");
					abort_handle.abort();
					true
				})
			}
		}
	}

	fn lock_controls(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, JobControl>> {
		self.controls.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::config::OrchestratorConfig;

	fn coordinator() -> (JobRegistry, CancellationCoordinator) {
		let registry = JobRegistry::new();
		let broadcaster = ProgressBroadcaster::new(registry.clone(), &OrchestratorConfig::default());

		(
			registry.clone(),
			CancellationCoordinator::new(registry, broadcaster, CancelTimeoutPolicy::Detach),
		)
	}

	fn running(registry: &JobRegistry) -> JobId {
		let id = registry.create("crawl", json!(null));
		registry
			.transition(id, JobStatus::Queued, JobStatus::Running)
			.unwrap();
		id
	}

	#[tokio::test]
	async fn interrupter_resolves_on_cancel() {
		let (registry, coordinator) = coordinator();
		let id = running(&registry);

		let (interrupter, _guard) = coordinator.register(id);
		assert!(!interrupter.is_interrupted());

		let child = interrupter.child_token();

		coordinator
			.controls
			.lock()
			.unwrap()
			.get(&id)
			.unwrap()
			.token
			.cancel();

		(&interrupter).await;
		assert!(interrupter.is_interrupted());
		assert!(child.is_cancelled());
	}

	#[tokio::test]
	async fn cancel_without_executor_settles_immediately() {
		let (registry, coordinator) = coordinator();
		let id = running(&registry);

		assert_eq!(
			coordinator.cancel(id, Duration::from_secs(1)).await.unwrap(),
			StopOutcome::Cancelled
		);
		assert_eq!(registry.get(id).unwrap().status, JobStatus::Cancelled);
	}

	#[tokio::test]
	async fn cancel_on_terminal_job_is_invalid_state() {
		let (registry, coordinator) = coordinator();
		let id = running(&registry);
		registry
			.finish(id, JobStatus::Running, Termination::Completed(None))
			.unwrap();

		assert!(matches!(
			coordinator.cancel(id, Duration::from_secs(1)).await,
			Err(Error::InvalidState {
				status: JobStatus::Completed,
				..
			})
		));
	}

	#[tokio::test]
	async fn dropped_guard_releases_the_waiter() {
		let (registry, coordinator) = coordinator();
		let id = running(&registry);

		let (interrupter, guard) = coordinator.register(id);
		assert!(coordinator.is_executing(id));

		let waiter = tokio::spawn({
			let coordinator = coordinator.clone();
			async move { coordinator.cancel(id, Duration::from_secs(30)).await }
		});

		(&interrupter).await;
		drop(guard);

		assert_eq!(waiter.await.unwrap().unwrap(), StopOutcome::Cancelled);
		assert!(!coordinator.is_executing(id));
	}
}
