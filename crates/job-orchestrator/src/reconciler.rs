//! Client side helpers to consume broadcasts without re-applying what the client already shows.

use std::{
	collections::{hash_map::Entry, HashMap},
	hash::Hash,
	time::Duration,
};

use tokio::time::Instant;
use tracing::trace;

use super::job::{Delivery, JobId, ProgressEvent};

/// A change the client applied locally before the server confirmed it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOptimisticChange<K, V> {
	pub entity_id: K,
	pub expected_value: V,
	pub applied_at: Instant,
	pub ttl: Duration,
}

impl<K, V> PendingOptimisticChange<K, V> {
	#[must_use]
	pub fn is_expired(&self, now: Instant) -> bool {
		now.duration_since(self.applied_at) >= self.ttl
	}
}

/// Suppresses server echoes of changes this client already applied optimistically.
///
/// At most one pending change is tracked per entity, and every entry expires after its TTL
/// even if the server never echoes it back. Expired entries are swept while recording new
/// ones, at most once per default TTL, so the table stays bounded without any explicit
/// [`ClientReconciler::purge_expired`] call. Owned by a single client, never shared.
#[derive(Debug)]
pub struct ClientReconciler<K, V> {
	pending: HashMap<K, PendingOptimisticChange<K, V>>,
	default_ttl: Duration,
	last_purge: Instant,
}

impl<K, V> Default for ClientReconciler<K, V>
where
	K: Eq + Hash + Clone,
	V: PartialEq,
{
	fn default() -> Self {
		Self::new(Self::DEFAULT_TTL)
	}
}

impl<K, V> ClientReconciler<K, V>
where
	K: Eq + Hash + Clone,
	V: PartialEq,
{
	pub const DEFAULT_TTL: Duration = Duration::from_secs(5);

	#[must_use]
	pub fn new(default_ttl: Duration) -> Self {
		Self {
			pending: HashMap::new(),
			default_ttl,
			last_purge: Instant::now(),
		}
	}

	#[must_use]
	pub const fn default_ttl(&self) -> Duration {
		self.default_ttl
	}

	/// Tracks a local change, replacing whatever was pending for the same entity
	pub fn record_optimistic(&mut self, entity_id: K, expected_value: V, ttl: Duration) {
		let now = Instant::now();

		if now.duration_since(self.last_purge) >= self.default_ttl {
			self.purge_expired();
		}

		self.pending.insert(
			entity_id.clone(),
			PendingOptimisticChange {
				entity_id,
				expected_value,
				applied_at: now,
				ttl,
			},
		);
	}

	/// Same as [`ClientReconciler::record_optimistic`] with the default TTL
	pub fn record(&mut self, entity_id: K, expected_value: V) {
		self.record_optimistic(entity_id, expected_value, self.default_ttl);
	}

	/// Whether an incoming server value should be applied to the client state.
	///
	/// An echo of a live pending change is suppressed. A different value always wins and
	/// clears the pending change it conflicts with.
	pub fn should_apply(&mut self, entity_id: &K, incoming: &V) -> bool {
		let now = Instant::now();

		let Entry::Occupied(entry) = self.pending.entry(entity_id.clone()) else {
			return true;
		};

		if entry.get().is_expired(now) {
			entry.remove();
			return true;
		}

		if entry.get().expected_value == *incoming {
			trace!("Suppressing echo of an optimistic change");
			return false;
		}

		trace!("Conflicting server value, dropping optimistic change");
		entry.remove();

		true
	}

	/// Drops the pending change of an entity, returning it if there was one
	pub fn acknowledge(&mut self, entity_id: &K) -> Option<PendingOptimisticChange<K, V>> {
		self.pending.remove(entity_id)
	}

	/// Drops every expired pending change, returning how many were dropped
	pub fn purge_expired(&mut self) -> usize {
		let now = Instant::now();
		let before = self.pending.len();

		self.pending.retain(|_, change| !change.is_expired(now));
		self.last_purge = now;

		let purged = before - self.pending.len();
		if purged > 0 {
			trace!(%purged, "Purged expired optimistic changes");
		}

		purged
	}

	#[must_use]
	pub fn pending(&self, entity_id: &K) -> Option<&PendingOptimisticChange<K, V>> {
		self.pending.get(entity_id)
	}

	#[must_use]
	pub fn pending_len(&self) -> usize {
		self.pending.len()
	}
}

/// Tracks the highest sequence seen per job, so redelivered or out of order events
/// (reconnects, replays, overlapping subscriptions) are applied only once.
#[derive(Debug, Default, Clone)]
pub struct EventCursor {
	last_sequences: HashMap<JobId, u64>,
}

impl EventCursor {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns `true` if `event` is newer than anything seen for its job, and records it
	pub fn observe(&mut self, event: &ProgressEvent) -> bool {
		match self.last_sequences.entry(event.job_id) {
			Entry::Vacant(entry) => {
				entry.insert(event.sequence);
				true
			}
			Entry::Occupied(mut entry) if event.sequence > *entry.get() => {
				entry.insert(event.sequence);
				true
			}
			Entry::Occupied(_) => {
				trace!(
					job_id = %event.job_id,
					sequence = event.sequence,
					"Skipping already seen event"
				);
				false
			}
		}
	}

	/// Events of `delivery` that weren't seen yet, in order
	pub fn accept(&mut self, delivery: Delivery) -> Vec<ProgressEvent> {
		delivery
			.into_events()
			.into_iter()
			.filter(|event| self.observe(event))
			.collect()
	}

	#[must_use]
	pub fn last_sequence(&self, job_id: JobId) -> Option<u64> {
		self.last_sequences.get(&job_id).copied()
	}

	/// Forgets a job, usually after handling its terminal event
	pub fn forget(&mut self, job_id: JobId) {
		self.last_sequences.remove(&job_id);
	}
}

#[cfg(test)]
mod tests {
	use chrono::Utc;
	use serde_json::{json, Value};

	use super::*;
	use crate::job::{JobStatus, Payload};

	#[tokio::test(start_paused = true)]
	async fn echo_is_suppressed_until_ttl_then_applied() {
		let mut reconciler = ClientReconciler::<&str, Value>::default();

		reconciler.record("T1", json!("A"));

		tokio::time::advance(Duration::from_secs(1)).await;
		assert!(!reconciler.should_apply(&"T1", &json!("A")));

		tokio::time::advance(Duration::from_secs(5)).await;
		assert!(reconciler.should_apply(&"T1", &json!("B")));
		assert_eq!(reconciler.pending_len(), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn expired_entry_applies_even_an_identical_value() {
		let mut reconciler = ClientReconciler::new(Duration::from_secs(5));

		reconciler.record_optimistic(7_u32, "done", Duration::from_secs(2));

		tokio::time::advance(Duration::from_secs(2)).await;
		assert!(reconciler.should_apply(&7, &"done"));
	}

	#[test]
	fn conflicting_value_wins_and_clears_pending() {
		let mut reconciler = ClientReconciler::default();

		reconciler.record("T1", json!({"done": true}));

		assert!(reconciler.should_apply(&"T1", &json!({"done": false})));
		assert!(reconciler.pending(&"T1").is_none());

		// Nothing pending anymore, so the echo of the old value goes through too
		assert!(reconciler.should_apply(&"T1", &json!({"done": true})));
	}

	#[test]
	fn new_local_change_overwrites_pending_one() {
		let mut reconciler = ClientReconciler::default();

		reconciler.record("T1", "A");
		reconciler.record("T1", "B");

		assert_eq!(reconciler.pending_len(), 1);
		assert!(reconciler.should_apply(&"T1", &"A"));
	}

	#[test]
	fn untracked_entities_always_apply() {
		let mut reconciler = ClientReconciler::<u64, u64>::default();

		assert!(reconciler.should_apply(&1, &1));
	}

	#[tokio::test(start_paused = true)]
	async fn acknowledge_and_purge() {
		let mut reconciler = ClientReconciler::default();

		reconciler.record("T1", 1);
		reconciler.record_optimistic("T2", 2, Duration::from_secs(60));

		assert_eq!(reconciler.acknowledge(&"T1").map(|change| change.expected_value), Some(1));
		assert!(reconciler.acknowledge(&"T1").is_none());

		reconciler.record("T3", 3);
		tokio::time::advance(Duration::from_secs(10)).await;

		assert_eq!(reconciler.purge_expired(), 1);
		assert!(reconciler.pending(&"T2").is_some());
	}

	#[tokio::test(start_paused = true)]
	async fn recording_sweeps_expired_changes() {
		let mut reconciler = ClientReconciler::default();

		for entity in 0..10_000_u64 {
			reconciler.record(entity, entity);
		}
		assert_eq!(reconciler.pending_len(), 10_000);

		tokio::time::advance(Duration::from_secs(60)).await;
		reconciler.record(10_000, 10_000);

		assert_eq!(reconciler.pending_len(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn sweep_keeps_changes_with_a_longer_ttl() {
		let mut reconciler = ClientReconciler::default();

		reconciler.record_optimistic("T1", 1, Duration::from_secs(30));
		reconciler.record("T2", 2);

		tokio::time::advance(Duration::from_secs(6)).await;
		reconciler.record("T3", 3);

		assert!(reconciler.pending(&"T1").is_some());
		assert!(reconciler.pending(&"T2").is_none());
		assert_eq!(reconciler.pending_len(), 2);
	}

	fn event(job_id: JobId, sequence: u64) -> ProgressEvent {
		ProgressEvent {
			job_id,
			sequence,
			status: JobStatus::Running,
			stale: false,
			payload: Some(Payload::snapshot(json!({"percent": sequence}))),
			error_detail: None,
			result_summary: None,
			emitted_at: Utc::now(),
		}
	}

	#[test]
	fn cursor_rejects_duplicates_and_older_events() {
		let job_id = JobId::new();
		let mut cursor = EventCursor::new();

		assert!(cursor.observe(&event(job_id, 1)));
		assert!(cursor.observe(&event(job_id, 3)));
		assert!(!cursor.observe(&event(job_id, 3)));
		assert!(!cursor.observe(&event(job_id, 2)));
		assert_eq!(cursor.last_sequence(job_id), Some(3));

		let accepted = cursor.accept(Delivery::Batch(vec![
			event(job_id, 2),
			event(job_id, 4),
			event(job_id, 5),
		]));
		assert_eq!(
			accepted.iter().map(|event| event.sequence).collect::<Vec<_>>(),
			vec![4, 5]
		);

		cursor.forget(job_id);
		assert!(cursor.last_sequence(job_id).is_none());
	}
}
