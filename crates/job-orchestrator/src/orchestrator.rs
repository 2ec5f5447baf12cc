use std::{
	any::Any,
	future::Future,
	panic::AssertUnwindSafe,
	sync::{Arc, Mutex, PoisonError},
	time::Duration,
};

use async_trait::async_trait;
use futures::FutureExt;
use futures_concurrency::future::Join;
use serde_json::Value;
use tokio::{
	spawn,
	task::JoinHandle,
	time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, instrument, trace, warn, Instrument};

use super::{
	broadcast::{ProgressBroadcaster, Subscription},
	cancel::{CancellationCoordinator, ExecutionGuard, Interrupter, StopOutcome},
	config::OrchestratorConfig,
	error::{Error, FailureReason, Result},
	job::{JobFilter, JobId, JobRecord, JobStatus, Payload, Termination},
	registry::JobRegistry,
	watchdog::StaleWatchdog,
};

/// Represents whether an [`Executor::run`] call finished its work or gave up because its job
/// was asked to stop.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecStatus {
	/// Work is done, with an optional summary stored in `JobRecord::result_summary`
	Done(Option<Value>),
	Canceled,
}

/// The unit of work behind a job.
///
/// Cancellation is cooperative: implementations must check the [`Interrupter`] in their
/// [`JobContext`] at every blocking or long-running step, either by awaiting it in a
/// `tokio::select!` or with the [`check_interruption!`](crate::check_interruption) macro.
/// Returning an error fails the job with the error's full context chain as detail.
///
/// Any `FnMut(JobContext) -> impl Future<Output = anyhow::Result<ExecStatus>>` closure is an
/// executor too.
#[async_trait]
pub trait Executor: Send + 'static {
	async fn run(&mut self, ctx: &JobContext) -> anyhow::Result<ExecStatus>;
}

#[async_trait]
impl<F, Fut> Executor for F
where
	F: FnMut(JobContext) -> Fut + Send + 'static,
	Fut: Future<Output = anyhow::Result<ExecStatus>> + Send + 'static,
{
	async fn run(&mut self, ctx: &JobContext) -> anyhow::Result<ExecStatus> {
		(self)(ctx.clone()).await
	}
}

/// Everything an executor gets to do its job
#[derive(Debug, Clone)]
pub struct JobContext {
	id: JobId,
	kind: String,
	spec: Value,
	interrupter: Interrupter,
	reporter: ProgressReporter,
}

impl JobContext {
	#[must_use]
	pub const fn id(&self) -> JobId {
		self.id
	}

	#[must_use]
	pub fn kind(&self) -> &str {
		&self.kind
	}

	#[must_use]
	pub const fn spec(&self) -> &Value {
		&self.spec
	}

	#[must_use]
	pub const fn interrupter(&self) -> &Interrupter {
		&self.interrupter
	}

	#[must_use]
	pub const fn reporter(&self) -> &ProgressReporter {
		&self.reporter
	}
}

/// Progress handle bound to a single job. Publishing never blocks the executor.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
	job_id: JobId,
	broadcaster: ProgressBroadcaster,
}

impl ProgressReporter {
	/// See [`ProgressBroadcaster::publish`]
	pub fn publish(&self, payload: Payload) -> Result<Option<u64>> {
		self.broadcaster.publish(self.job_id, payload)
	}

	/// Publishes a latest-wins payload, like a percentage
	pub fn snapshot(&self, value: impl Into<Value>) -> Result<Option<u64>> {
		self.publish(Payload::snapshot(value))
	}

	/// Publishes a payload that must reach subscribers even when followed by others,
	/// like "page N fetched"
	pub fn discrete(&self, value: impl Into<Value>) -> Result<Option<u64>> {
		self.publish(Payload::discrete(value))
	}
}

#[derive(Debug)]
struct Inner {
	config: OrchestratorConfig,
	registry: JobRegistry,
	broadcaster: ProgressBroadcaster,
	coordinator: CancellationCoordinator,
	maintenance_token: CancellationToken,
	maintenance_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
	fn drop(&mut self) {
		self.maintenance_token.cancel();
	}
}

/// Entry point of the engine: starts jobs, stops them and exposes their state and progress.
///
/// Cheap to clone, every clone drives the same set of jobs.
#[derive(Debug, Clone)]
pub struct JobOrchestrator {
	inner: Arc<Inner>,
}

impl JobOrchestrator {
	/// Builds the orchestrator and spawns its maintenance loop (stale scans and cleanup
	/// of terminated jobs). Must be called from within a tokio runtime.
	#[must_use]
	pub fn new(config: OrchestratorConfig) -> Self {
		let registry = JobRegistry::new();
		let broadcaster = ProgressBroadcaster::new(registry.clone(), &config);
		let coordinator = CancellationCoordinator::new(
			registry.clone(),
			broadcaster.clone(),
			config.on_cancel_timeout,
		);

		let maintenance_token = CancellationToken::new();
		let maintenance_handle = spawn(
			Maintenance {
				watchdog: StaleWatchdog::new(
					registry.clone(),
					broadcaster.clone(),
					config.stale_timeout(),
				),
				registry: registry.clone(),
				broadcaster: broadcaster.clone(),
				period: config.watchdog_interval(),
				event_retention: config.event_retention(),
				record_retention: config.record_retention(),
			}
			.run(maintenance_token.clone())
			.in_current_span(),
		);

		Self {
			inner: Arc::new(Inner {
				config,
				registry,
				broadcaster,
				coordinator,
				maintenance_token,
				maintenance_handle: Mutex::new(Some(maintenance_handle)),
			}),
		}
	}

	/// Creates a job, moves it to `Running` and spawns its executor
	pub fn start(
		&self,
		kind: impl Into<String>,
		spec: Value,
		executor: impl Executor,
	) -> Result<JobId> {
		let kind = kind.into();
		let registry = &self.inner.registry;

		let job_id = registry.create(kind.clone(), spec.clone());

		// The executor must be attached before the job is visible as `Running`, otherwise a
		// concurrent stop finds nothing to wait for and settles the job under its feet
		let (interrupter, guard) = self.inner.coordinator.register(job_id);
		registry.transition(job_id, JobStatus::Queued, JobStatus::Running)?;

		let ctx = JobContext {
			id: job_id,
			kind: kind.clone(),
			spec,
			interrupter,
			reporter: ProgressReporter {
				job_id,
				broadcaster: self.inner.broadcaster.clone(),
			},
		};

		let handle = spawn(
			run_executor(
				executor,
				ctx,
				guard,
				registry.clone(),
				self.inner.broadcaster.clone(),
			)
			.instrument(info_span!("job", %job_id, %kind)),
		);

		self.inner
			.coordinator
			.attach_abort_handle(job_id, handle.abort_handle());

		debug!(%job_id, %kind, "Job started");

		Ok(job_id)
	}

	/// Stops a job, waiting up to the configured grace period for its executor.
	///
	/// Stopping a finished job is not an error, it yields [`StopOutcome::AlreadyFinished`].
	pub async fn stop(&self, job_id: JobId) -> Result<StopOutcome> {
		self.stop_with_grace(job_id, self.inner.config.stop_grace_period())
			.await
	}

	#[instrument(skip(self), fields(%job_id))]
	pub async fn stop_with_grace(
		&self,
		job_id: JobId,
		grace_period: Duration,
	) -> Result<StopOutcome> {
		match self.inner.coordinator.cancel(job_id, grace_period).await {
			Err(Error::InvalidState { status, .. }) if status.is_terminal() => {
				trace!(%status, "Stop requested on a finished job");
				Ok(StopOutcome::AlreadyFinished(status))
			}
			other => other,
		}
	}

	pub fn status(&self, job_id: JobId) -> Result<JobRecord> {
		self.inner
			.registry
			.get(job_id)
			.ok_or(Error::JobNotFound(job_id))
	}

	#[must_use]
	pub fn list(&self, filter: &JobFilter) -> Vec<JobRecord> {
		self.inner.registry.list(filter)
	}

	pub fn subscribe(&self, job_id: JobId) -> Result<Subscription> {
		self.inner.broadcaster.subscribe(job_id)
	}

	pub fn subscribe_from(&self, job_id: JobId, after_sequence: u64) -> Result<Subscription> {
		self.inner.broadcaster.subscribe_from(job_id, after_sequence)
	}

	#[must_use]
	pub fn config(&self) -> &OrchestratorConfig {
		&self.inner.config
	}

	#[must_use]
	pub fn registry(&self) -> &JobRegistry {
		&self.inner.registry
	}

	#[must_use]
	pub fn broadcaster(&self) -> &ProgressBroadcaster {
		&self.inner.broadcaster
	}

	#[must_use]
	pub fn coordinator(&self) -> &CancellationCoordinator {
		&self.inner.coordinator
	}

	/// Stops the maintenance loop, then every running job concurrently with the default
	/// grace period. Returns how each stop went.
	pub async fn shutdown(&self) -> Vec<(JobId, Result<StopOutcome>)> {
		self.inner.maintenance_token.cancel();

		let maintenance_handle = self
			.inner
			.maintenance_handle
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take();

		if let Some(handle) = maintenance_handle {
			if let Err(e) = handle.await {
				error!(?e, "Maintenance loop panicked");
			}
		}

		let running = self
			.inner
			.registry
			.list(&JobFilter::default().with_status(JobStatus::Running));

		debug!(jobs = running.len(), "Shutting down orchestrator");

		running
			.into_iter()
			.map(|record| async move { (record.id, self.stop(record.id).await) })
			.collect::<Vec<_>>()
			.join()
			.await
	}
}

async fn run_executor(
	mut executor: impl Executor,
	ctx: JobContext,
	guard: ExecutionGuard,
	registry: JobRegistry,
	broadcaster: ProgressBroadcaster,
) {
	trace!("Executor running");

	let termination = match AssertUnwindSafe(executor.run(&ctx)).catch_unwind().await {
		Ok(Ok(ExecStatus::Done(result_summary))) => {
			trace!("Executor done");
			Termination::Completed(result_summary)
		}
		Ok(Ok(ExecStatus::Canceled)) => {
			trace!("Executor canceled");
			Termination::Cancelled
		}
		Ok(Err(e)) => {
			let reason = FailureReason::from_executor(&e);
			warn!(%reason, "Executor failed");
			Termination::Failed(reason.to_string())
		}
		Err(panic) => {
			let reason = FailureReason::Panicked(panic_message(panic.as_ref()));
			error!(%reason, "Executor panicked");
			Termination::Failed(reason.to_string())
		}
	};

	finalize(ctx.id, termination, &registry, &broadcaster);

	// Waiters on a stop request must only wake once the outcome is in the registry
	drop(guard);
}

/// Lands the executor's outcome in the registry, whatever status the job moved to while
/// it was running, and broadcasts it if this call won.
fn finalize(
	job_id: JobId,
	termination: Termination,
	registry: &JobRegistry,
	broadcaster: &ProgressBroadcaster,
) {
	loop {
		let Some(record) = registry.get(job_id) else {
			warn!("Job record vanished before its executor returned");
			return;
		};

		match record.status {
			// An executor giving up on its own still goes through `Stopping`
			JobStatus::Running if matches!(termination, Termination::Cancelled) => {
				if let Ok(record) = registry.request_cancel(job_id) {
					broadcaster.announce_stopping(&record);
				}
			}

			status if status.is_active() => {
				match registry.finish(job_id, status, termination.clone()) {
					Ok(record) => {
						broadcaster.finish(&record);
						return;
					}
					// Lost a race against a stop request, look again
					Err(Error::InvalidTransition { .. }) => {}
					Err(e) => {
						error!(?e, "Failed to record executor outcome");
						return;
					}
				}
			}

			status => {
				warn!(
					%status,
					outcome = %termination.status(),
					"Ignoring late executor result, job already finished"
				);
				return;
			}
		}
	}
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
	panic
		.downcast_ref::<&str>()
		.map(ToString::to_string)
		.or_else(|| panic.downcast_ref::<String>().cloned())
		.unwrap_or_else(|| "unknown panic payload".to_string())
}

struct Maintenance {
	watchdog: StaleWatchdog,
	registry: JobRegistry,
	broadcaster: ProgressBroadcaster,
	period: Duration,
	event_retention: Duration,
	record_retention: Option<Duration>,
}

impl Maintenance {
	async fn run(self, stop: CancellationToken) {
		let mut ticker = interval(self.period);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

		loop {
			tokio::select! {
				() = stop.cancelled() => {
					trace!("Maintenance loop stopping");
					break;
				}
				_ = ticker.tick() => {
					self.watchdog.scan();
					self.broadcaster.evict_terminated(self.event_retention);

					if let Some(record_retention) = self.record_retention {
						self.registry.purge_terminated(record_retention);
					}
				}
			}
		}
	}
}
