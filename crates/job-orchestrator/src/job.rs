//! Core types shared by every component of the orchestrator

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
	#[must_use]
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}
}

impl Default for JobId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for JobId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl From<Uuid> for JobId {
	fn from(uuid: Uuid) -> Self {
		Self(uuid)
	}
}

impl From<JobId> for Uuid {
	fn from(id: JobId) -> Self {
		id.0
	}
}

/// Lifecycle status of a job.
///
/// ```text
/// Queued -> Running -> Completed | Failed
///                   -> Stopping -> Cancelled | Completed | Failed
/// ```
///
/// Staleness is not a status, see [`JobRecord::stale`].
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "lowercase")]
pub enum JobStatus {
	Queued,
	Running,
	/// A cancellation request won the latch and the executor was signaled
	Stopping,
	Completed,
	Cancelled,
	Failed,
}

impl JobStatus {
	#[must_use]
	pub const fn is_terminal(&self) -> bool {
		matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
	}

	#[must_use]
	pub const fn is_active(&self) -> bool {
		matches!(self, Self::Running | Self::Stopping)
	}

	/// Every edge of the lifecycle state machine, nothing else is a valid transition.
	#[must_use]
	pub const fn can_transition_to(&self, to: Self) -> bool {
		matches!(
			(self, to),
			(Self::Queued, Self::Running)
				| (Self::Running, Self::Stopping | Self::Completed | Self::Failed)
				| (Self::Stopping, Self::Cancelled | Self::Completed | Self::Failed)
		)
	}
}

/// How a job reached a terminal status, along with the data the terminal status carries.
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
	Completed(Option<Value>),
	Cancelled,
	Failed(String),
}

impl Termination {
	#[must_use]
	pub const fn status(&self) -> JobStatus {
		match self {
			Self::Completed(_) => JobStatus::Completed,
			Self::Cancelled => JobStatus::Cancelled,
			Self::Failed(_) => JobStatus::Failed,
		}
	}
}

/// Authoritative state of a job. Only the [`JobRegistry`](crate::JobRegistry) writes it,
/// everyone else gets clones.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
	pub id: JobId,
	/// Executor type tag (crawl, upload, refresh...), only used for routing and logging
	pub kind: String,
	pub spec: Value,
	pub status: JobStatus,
	/// Observational flag set by the watchdog while a running job stays silent
	pub stale: bool,
	pub cancel_requested: bool,
	pub created_at: DateTime<Utc>,
	pub last_progress_at: DateTime<Utc>,
	pub terminated_at: Option<DateTime<Utc>>,
	pub error_detail: Option<String>,
	pub result_summary: Option<Value>,
}

impl JobRecord {
	pub(crate) fn new(kind: String, spec: Value) -> Self {
		let now = Utc::now();

		Self {
			id: JobId::new(),
			kind,
			spec,
			status: JobStatus::Queued,
			stale: false,
			cancel_requested: false,
			created_at: now,
			last_progress_at: now,
			terminated_at: None,
			error_detail: None,
			result_summary: None,
		}
	}
}

/// Selects records out of [`JobRegistry::list`](crate::JobRegistry::list), unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
	pub status: Option<JobStatus>,
	pub kind: Option<String>,
	pub stale: Option<bool>,
}

impl JobFilter {
	#[must_use]
	pub fn with_status(mut self, status: JobStatus) -> Self {
		self.status = Some(status);
		self
	}

	#[must_use]
	pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
		self.kind = Some(kind.into());
		self
	}

	#[must_use]
	pub fn with_stale(mut self, stale: bool) -> Self {
		self.stale = Some(stale);
		self
	}

	#[must_use]
	pub fn matches(&self, record: &JobRecord) -> bool {
		self.status.map_or(true, |status| record.status == status)
			&& self
				.kind
				.as_deref()
				.map_or(true, |kind| record.kind == kind)
			&& self.stale.map_or(true, |stale| record.stale == stale)
	}
}

/// Progress data reported by an executor. The engine only compares payloads for equality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
	/// Point-in-time state (percentage, counters), only the latest one in a batching
	/// window is delivered
	Snapshot(Value),
	/// Something that happened ("page 12 fetched"), every one of them is delivered
	Discrete(Value),
}

impl Payload {
	pub fn snapshot(value: impl Into<Value>) -> Self {
		Self::Snapshot(value.into())
	}

	pub fn discrete(value: impl Into<Value>) -> Self {
		Self::Discrete(value.into())
	}

	#[must_use]
	pub const fn value(&self) -> &Value {
		match self {
			Self::Snapshot(value) | Self::Discrete(value) => value,
		}
	}

	#[must_use]
	pub const fn is_discrete(&self) -> bool {
		matches!(self, Self::Discrete(_))
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
	pub job_id: JobId,
	/// Per job, strictly increasing in delivery order. `0` is reserved for the synthetic
	/// state event of a job that has not emitted anything yet.
	pub sequence: u64,
	pub status: JobStatus,
	pub stale: bool,
	pub payload: Option<Payload>,
	pub error_detail: Option<String>,
	pub result_summary: Option<Value>,
	pub emitted_at: DateTime<Utc>,
}

impl ProgressEvent {
	#[must_use]
	pub const fn is_terminal(&self) -> bool {
		self.status.is_terminal()
	}

	/// Whether a later event in the same batching window makes this one redundant.
	/// Only holds for progress, status announcements never sit in a batching window.
	pub(crate) fn is_coalescable(&self) -> bool {
		!self.status.is_terminal() && !self.payload.as_ref().is_some_and(Payload::is_discrete)
	}
}

/// What a subscriber receives: a lone event or a window worth of events, always
/// ordered by sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "events", rename_all = "snake_case")]
pub enum Delivery {
	Single(ProgressEvent),
	Batch(Vec<ProgressEvent>),
}

impl Delivery {
	pub(crate) fn from_events(mut events: Vec<ProgressEvent>) -> Option<Self> {
		match events.len() {
			0 => None,
			1 => events.pop().map(Self::Single),
			_ => Some(Self::Batch(events)),
		}
	}

	#[must_use]
	pub fn events(&self) -> &[ProgressEvent] {
		match self {
			Self::Single(event) => std::slice::from_ref(event),
			Self::Batch(events) => events,
		}
	}

	#[must_use]
	pub fn into_events(self) -> Vec<ProgressEvent> {
		match self {
			Self::Single(event) => vec![event],
			Self::Batch(events) => events,
		}
	}

	#[must_use]
	pub fn last(&self) -> Option<&ProgressEvent> {
		self.events().last()
	}
}
