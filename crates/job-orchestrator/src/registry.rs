use std::{
	collections::HashMap,
	sync::{Arc, PoisonError, RwLock},
	time::Duration,
};

use chrono::Utc;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{
	error::{Error, Result},
	job::{JobFilter, JobId, JobRecord, JobStatus, Termination},
};

#[derive(Debug)]
struct Entry {
	record: JobRecord,
	// Monotonic twins of the record timestamps, so staleness and retention work
	// with tokio's paused clock
	last_progress: Instant,
	terminated: Option<Instant>,
	// Sequence of the terminal event, once broadcast
	final_sequence: Option<u64>,
}

/// The authoritative in-memory table of jobs.
///
/// Every status change goes through [`JobRegistry::transition`] or [`JobRegistry::finish`],
/// which are compare-and-swap operations on the status: whoever lands first wins and the
/// loser gets an [`Error::InvalidTransition`].
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
	jobs: Arc<RwLock<HashMap<JobId, Entry>>>,
}

impl JobRegistry {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Creates a `Queued` job and returns its id
	pub fn create(&self, kind: impl Into<String>, spec: Value) -> JobId {
		let record = JobRecord::new(kind.into(), spec);
		let id = record.id;

		trace!(job_id = %id, kind = %record.kind, "Creating job record");

		self.jobs.write().unwrap_or_else(PoisonError::into_inner).insert(
			id,
			Entry {
				record,
				last_progress: Instant::now(),
				terminated: None,
				final_sequence: None,
			},
		);

		id
	}

	#[must_use]
	pub fn get(&self, id: JobId) -> Option<JobRecord> {
		self.jobs
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.get(&id)
			.map(|entry| entry.record.clone())
	}

	/// Snapshot of all matching records, oldest first
	#[must_use]
	pub fn list(&self, filter: &JobFilter) -> Vec<JobRecord> {
		let mut records = self
			.jobs
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.values()
			.filter(|entry| filter.matches(&entry.record))
			.map(|entry| entry.record.clone())
			.collect::<Vec<_>>();

		records.sort_by_key(|record| record.created_at);

		records
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Moves `id` from `from` to the non-terminal status `to`. Terminal statuses must go
	/// through [`JobRegistry::finish`] so they always carry their outcome.
	pub fn transition(&self, id: JobId, from: JobStatus, to: JobStatus) -> Result<JobRecord> {
		if to.is_terminal() {
			let found = self.get(id).ok_or(Error::JobNotFound(id))?.status;

			return Err(Error::InvalidTransition {
				id,
				expected: from,
				found,
				to,
			});
		}

		self.compare_and_swap(id, from, to, |_| {})
	}

	/// Moves `id` from `from` to the terminal status described by `termination`
	pub fn finish(&self, id: JobId, from: JobStatus, termination: Termination) -> Result<JobRecord> {
		let to = termination.status();

		self.compare_and_swap(id, from, to, move |entry| {
			entry.terminated = Some(Instant::now());
			entry.record.terminated_at = Some(Utc::now());

			match termination {
				Termination::Completed(result_summary) => {
					entry.record.result_summary = result_summary;
				}
				Termination::Failed(error_detail) => {
					entry.record.error_detail = Some(error_detail);
				}
				Termination::Cancelled => {}
			}
		})
	}

	/// Latches the cancellation request and moves `Running -> Stopping` in one step.
	/// Only the first caller succeeds, the latch never goes back to `false`.
	pub fn request_cancel(&self, id: JobId) -> Result<JobRecord> {
		self.compare_and_swap(id, JobStatus::Running, JobStatus::Stopping, |entry| {
			entry.record.cancel_requested = true;
		})
	}

	fn compare_and_swap(
		&self,
		id: JobId,
		from: JobStatus,
		to: JobStatus,
		update: impl FnOnce(&mut Entry),
	) -> Result<JobRecord> {
		let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);

		let entry = jobs.get_mut(&id).ok_or(Error::JobNotFound(id))?;
		let found = entry.record.status;

		if found != from || !from.can_transition_to(to) {
			trace!(job_id = %id, %from, %to, %found, "Rejected job transition");
			return Err(Error::InvalidTransition {
				id,
				expected: from,
				found,
				to,
			});
		}

		entry.record.status = to;
		if !to.is_active() {
			entry.record.stale = false;
		}
		update(entry);

		trace!(job_id = %id, %from, %to, "Job transitioned");

		Ok(entry.record.clone())
	}

	/// Bumps `last_progress_at` and clears the stale flag of an active job, returning its
	/// current record. Terminal jobs are left untouched.
	pub fn record_progress(&self, id: JobId) -> Result<JobRecord> {
		let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);

		let entry = jobs.get_mut(&id).ok_or(Error::JobNotFound(id))?;

		if !entry.record.status.is_active() {
			return Err(Error::InvalidState {
				id,
				status: entry.record.status,
			});
		}

		entry.last_progress = Instant::now();
		entry.record.last_progress_at = Utc::now();
		entry.record.stale = false;

		Ok(entry.record.clone())
	}

	/// Remembers the sequence the terminal event of `id` was broadcast with, so it
	/// outlives the broadcaster's per job state
	pub(crate) fn set_final_sequence(&self, id: JobId, sequence: u64) {
		if let Some(entry) = self
			.jobs
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.get_mut(&id)
		{
			entry.final_sequence = Some(sequence);
		}
	}

	/// Sequence of the terminal event broadcast for `id`, if any
	#[must_use]
	pub fn final_sequence(&self, id: JobId) -> Option<u64> {
		self.jobs
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.get(&id)
			.and_then(|entry| entry.final_sequence)
	}

	/// Flags every `Running` job silent for longer than `timeout`, returning the ones that
	/// were newly flagged. Statuses are never touched.
	pub fn mark_stale(&self, timeout: Duration) -> Vec<JobRecord> {
		let now = Instant::now();

		self.jobs
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.values_mut()
			.filter(|entry| {
				entry.record.status == JobStatus::Running
					&& !entry.record.stale
					&& now.duration_since(entry.last_progress) > timeout
			})
			.map(|entry| {
				entry.record.stale = true;
				entry.record.clone()
			})
			.collect()
	}

	/// Drops terminal records older than `retention`, returning how many were removed
	pub fn purge_terminated(&self, retention: Duration) -> usize {
		let now = Instant::now();
		let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);

		let before = jobs.len();
		jobs.retain(|_, entry| {
			entry
				.terminated
				.map_or(true, |terminated| now.duration_since(terminated) <= retention)
		});
		let removed = before - jobs.len();

		if removed > 0 {
			debug!(%removed, "Purged terminated job records");
		}

		removed
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn running(registry: &JobRegistry) -> JobId {
		let id = registry.create("crawl", json!({"url": "https://example.com"}));
		registry
			.transition(id, JobStatus::Queued, JobStatus::Running)
			.unwrap();
		id
	}

	#[test]
	fn create_starts_queued() {
		let registry = JobRegistry::new();
		let id = registry.create("upload", json!(null));

		let record = registry.get(id).unwrap();
		assert_eq!(record.status, JobStatus::Queued);
		assert_eq!(record.kind, "upload");
		assert!(!record.cancel_requested);
		assert!(record.terminated_at.is_none());
	}

	#[test]
	fn mismatched_from_is_rejected_without_side_effects() {
		let registry = JobRegistry::new();
		let id = running(&registry);

		let before = registry.get(id).unwrap();

		assert!(matches!(
			registry.transition(id, JobStatus::Queued, JobStatus::Running),
			Err(Error::InvalidTransition {
				found: JobStatus::Running,
				..
			})
		));
		assert_eq!(registry.get(id).unwrap(), before);
	}

	#[test]
	fn edges_outside_the_state_machine_are_rejected() {
		let registry = JobRegistry::new();
		let id = registry.create("refresh", json!(null));

		assert!(matches!(
			registry.transition(id, JobStatus::Queued, JobStatus::Stopping),
			Err(Error::InvalidTransition { .. })
		));
		assert!(matches!(
			registry.finish(id, JobStatus::Queued, Termination::Cancelled),
			Err(Error::InvalidTransition { .. })
		));
		assert_eq!(registry.get(id).unwrap().status, JobStatus::Queued);
	}

	#[test]
	fn terminal_statuses_require_finish() {
		let registry = JobRegistry::new();
		let id = running(&registry);

		assert!(registry
			.transition(id, JobStatus::Running, JobStatus::Completed)
			.is_err());

		let record = registry
			.finish(id, JobStatus::Running, Termination::Completed(Some(json!({"pages": 3}))))
			.unwrap();

		assert_eq!(record.status, JobStatus::Completed);
		assert_eq!(record.result_summary, Some(json!({"pages": 3})));
		assert!(record.terminated_at.is_some());
	}

	#[test]
	fn terminal_records_are_immutable() {
		let registry = JobRegistry::new();
		let id = running(&registry);

		registry
			.finish(id, JobStatus::Running, Termination::Failed("boom".into()))
			.unwrap();
		let failed = registry.get(id).unwrap();

		assert!(registry.request_cancel(id).is_err());
		assert!(registry
			.finish(id, JobStatus::Failed, Termination::Cancelled)
			.is_err());
		assert!(matches!(
			registry.record_progress(id),
			Err(Error::InvalidState {
				status: JobStatus::Failed,
				..
			})
		));
		assert_eq!(registry.get(id).unwrap(), failed);
	}

	#[test]
	fn cancel_latch_is_set_once() {
		let registry = JobRegistry::new();
		let id = running(&registry);

		let record = registry.request_cancel(id).unwrap();
		assert!(record.cancel_requested);
		assert_eq!(record.status, JobStatus::Stopping);

		assert!(registry.request_cancel(id).is_err());
		assert!(registry.get(id).unwrap().cancel_requested);
	}

	#[test]
	fn unknown_job_is_not_found() {
		let registry = JobRegistry::new();
		let id = JobId::new();

		assert!(registry.get(id).is_none());
		assert!(matches!(
			registry.transition(id, JobStatus::Queued, JobStatus::Running),
			Err(Error::JobNotFound(missing)) if missing == id
		));
	}

	#[test]
	fn list_filters_by_status_and_kind() {
		let registry = JobRegistry::new();
		let crawl = running(&registry);
		registry.create("upload", json!(null));

		let running_jobs = registry.list(&JobFilter::default().with_status(JobStatus::Running));
		assert_eq!(running_jobs.len(), 1);
		assert_eq!(running_jobs[0].id, crawl);

		assert_eq!(registry.list(&JobFilter::default().with_kind("upload")).len(), 1);
		assert_eq!(registry.list(&JobFilter::default()).len(), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn stale_flag_is_set_once_and_cleared_by_progress() {
		let registry = JobRegistry::new();
		let id = running(&registry);

		tokio::time::advance(Duration::from_secs(121)).await;

		let flagged = registry.mark_stale(Duration::from_secs(120));
		assert_eq!(flagged.len(), 1);
		assert_eq!(flagged[0].status, JobStatus::Running);
		assert!(registry.mark_stale(Duration::from_secs(120)).is_empty());

		let record = registry.record_progress(id).unwrap();
		assert!(!record.stale);
		assert!(registry.mark_stale(Duration::from_secs(120)).is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn purge_only_drops_old_terminal_records() {
		let registry = JobRegistry::new();
		let done = running(&registry);
		let alive = running(&registry);

		registry
			.finish(done, JobStatus::Running, Termination::Completed(None))
			.unwrap();

		assert_eq!(registry.purge_terminated(Duration::from_secs(60)), 0);

		tokio::time::advance(Duration::from_secs(61)).await;

		assert_eq!(registry.purge_terminated(Duration::from_secs(60)), 1);
		assert!(registry.get(done).is_none());
		assert!(registry.get(alive).is_some());
	}
}
