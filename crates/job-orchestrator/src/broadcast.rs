//! Per job progress fan-out.
//!
//! Every job gets a topic holding its sequence counter, the dedup state, the pending
//! batch and the subscribers queues. Publishing follows a leading-edge throttle: an event
//! published while no batching window is open goes out right away and opens a window,
//! events published inside it are held, coalesced and flushed when the window closes.
//! A flush that delivered something keeps the window open for another period.
//!
//! Status changes (`Stopping` and terminal events) skip both dedup and batching, but they
//! flush whatever is pending first so sequences never go backwards for a subscriber.

use std::{
	collections::{HashMap, VecDeque},
	pin::Pin,
	sync::{Arc, Mutex, PoisonError},
	task::{Context, Poll},
	time::Duration,
};

use async_channel as chan;
use chrono::Utc;
use futures::Stream;
use tokio::{
	spawn,
	time::{sleep, Instant},
};
use tracing::{debug, trace, Instrument};

use super::{
	config::OrchestratorConfig,
	error::{Error, Result},
	job::{Delivery, JobId, JobRecord, JobStatus, Payload, ProgressEvent},
	registry::JobRegistry,
};

#[derive(Debug)]
struct Topic {
	next_sequence: u64,
	last_accepted: Option<(Payload, Instant)>,
	last_snapshot: Option<Payload>,
	pending: Vec<ProgressEvent>,
	window_open: bool,
	subscribers: Vec<chan::Sender<Delivery>>,
	replay: VecDeque<ProgressEvent>,
	last_delivered: Option<ProgressEvent>,
	terminated: Option<(ProgressEvent, Instant)>,
}

impl Topic {
	const fn new() -> Self {
		Self {
			next_sequence: 1,
			last_accepted: None,
			last_snapshot: None,
			pending: Vec::new(),
			window_open: false,
			subscribers: Vec::new(),
			replay: VecDeque::new(),
			last_delivered: None,
			terminated: None,
		}
	}

	fn next_sequence(&mut self) -> u64 {
		let sequence = self.next_sequence;
		self.next_sequence += 1;
		sequence
	}

	/// Payload carried by status events. Discrete payloads are never repeated, a client
	/// would apply them twice.
	fn last_payload(&self) -> Option<Payload> {
		self.last_snapshot.clone()
	}
}

#[derive(Debug)]
struct Inner {
	registry: JobRegistry,
	topics: Mutex<HashMap<JobId, Topic>>,
	dedup_window: Duration,
	batch_window: Duration,
	subscriber_buffer: usize,
	replay_capacity: usize,
}

/// Deduplicates, batches and fans out progress events to any number of subscribers per job.
#[derive(Debug, Clone)]
pub struct ProgressBroadcaster {
	inner: Arc<Inner>,
}

impl ProgressBroadcaster {
	#[must_use]
	pub fn new(registry: JobRegistry, config: &OrchestratorConfig) -> Self {
		Self {
			inner: Arc::new(Inner {
				registry,
				topics: Mutex::new(HashMap::new()),
				dedup_window: config.dedup_window(),
				batch_window: config.batch_window(),
				subscriber_buffer: config.subscriber_buffer.max(1),
				replay_capacity: config.replay_capacity,
			}),
		}
	}

	/// Reports progress for an active job, returning the assigned sequence or `None` when
	/// the payload was a duplicate of the last accepted one inside the dedup window.
	///
	/// Never blocks: slow subscribers lose their oldest deliveries instead.
	/// Must be called from within a tokio runtime, as it may arm a batching timer.
	pub fn publish(&self, job_id: JobId, payload: Payload) -> Result<Option<u64>> {
		let mut topics = self.inner.lock_topics();

		if !topics.contains_key(&job_id) {
			let record = self
				.inner
				.registry
				.get(job_id)
				.ok_or(Error::JobNotFound(job_id))?;

			// A topic created for a finished job would never be evicted
			if !record.status.is_active() {
				return Err(Error::InvalidState {
					id: job_id,
					status: record.status,
				});
			}
		}
		let topic = topics.entry(job_id).or_insert_with(Topic::new);

		if let Some((terminal, _)) = &topic.terminated {
			return Err(Error::InvalidState {
				id: job_id,
				status: terminal.status,
			});
		}

		let now = Instant::now();
		if let Some((last_payload, accepted_at)) = &topic.last_accepted {
			if *last_payload == payload && now.duration_since(*accepted_at) < self.inner.dedup_window
			{
				trace!(%job_id, "Dropping duplicate progress payload");
				return Ok(None);
			}
		}

		let record = self.inner.registry.record_progress(job_id)?;

		let sequence = topic.next_sequence();
		topic.last_accepted = Some((payload.clone(), now));
		if !payload.is_discrete() {
			topic.last_snapshot = Some(payload.clone());
		}

		let event = ProgressEvent {
			job_id,
			sequence,
			status: record.status,
			stale: false,
			payload: Some(payload),
			error_detail: None,
			result_summary: None,
			emitted_at: Utc::now(),
		};

		if self.inner.enqueue(topic, event) {
			self.spawn_window(job_id);
		}

		Ok(Some(sequence))
	}

	/// Broadcasts a `Running` event with the stale flag set, carrying the last known payload.
	/// It is batched like any progress event but never deduplicated.
	pub fn announce_stale(&self, record: &JobRecord) {
		let mut topics = self.inner.lock_topics();
		let topic = topics.entry(record.id).or_insert_with(Topic::new);

		if topic.terminated.is_some() {
			return;
		}

		let event = ProgressEvent {
			job_id: record.id,
			sequence: topic.next_sequence(),
			status: JobStatus::Running,
			stale: true,
			payload: topic.last_payload(),
			error_detail: None,
			result_summary: None,
			emitted_at: Utc::now(),
		};

		if self.inner.enqueue(topic, event) {
			self.spawn_window(record.id);
		}
	}

	/// Tells every subscriber right away that a stop was requested
	pub fn announce_stopping(&self, record: &JobRecord) {
		let mut topics = self.inner.lock_topics();
		let topic = topics.entry(record.id).or_insert_with(Topic::new);

		if topic.terminated.is_some() {
			return;
		}

		let mut events = coalesce(std::mem::take(&mut topic.pending));
		events.push(ProgressEvent {
			job_id: record.id,
			sequence: topic.next_sequence(),
			status: JobStatus::Stopping,
			stale: false,
			payload: topic.last_payload(),
			error_detail: None,
			result_summary: None,
			emitted_at: Utc::now(),
		});

		self.inner.send(topic, events);
	}

	/// Delivers the terminal event of `record` and closes every subscriber stream.
	/// Only the first call for a job has any effect.
	pub fn finish(&self, record: &JobRecord) {
		debug_assert!(record.status.is_terminal());

		let mut topics = self.inner.lock_topics();
		let topic = topics.entry(record.id).or_insert_with(Topic::new);

		if topic.terminated.is_some() {
			trace!(job_id = %record.id, "Terminal event already delivered");
			return;
		}

		let pending = std::mem::take(&mut topic.pending);
		self.inner.deliver(topic, pending);

		let terminal = ProgressEvent {
			job_id: record.id,
			sequence: topic.next_sequence(),
			status: record.status,
			stale: false,
			payload: topic.last_payload(),
			error_detail: record.error_detail.clone(),
			result_summary: record.result_summary.clone(),
			emitted_at: Utc::now(),
		};

		debug!(
			job_id = %record.id,
			status = %record.status,
			subscribers = topic.subscribers.len(),
			"Delivering terminal event"
		);

		// A full queue gives up its oldest progress to make room, so the terminal event
		// always lands unless the subscriber is gone
		for subscriber in topic.subscribers.drain(..) {
			if subscriber
				.force_send(Delivery::Single(terminal.clone()))
				.is_err()
			{
				trace!(job_id = %record.id, "Subscriber left before the terminal event");
			}
			subscriber.close();
		}

		self.inner.remember(topic, std::slice::from_ref(&terminal));
		self.inner
			.registry
			.set_final_sequence(record.id, terminal.sequence);
		topic.window_open = false;
		topic.terminated = Some((terminal, Instant::now()));
	}

	/// Subscribes to a job. The stream starts with the current state of the job (the last
	/// delivered event, or a synthetic one with sequence `0`) and then follows live.
	/// A terminated job yields its terminal event and the stream ends.
	pub fn subscribe(&self, job_id: JobId) -> Result<Subscription> {
		self.inner.subscribe(job_id, None)
	}

	/// Subscribes to a job, replaying the retained events newer than `after_sequence`
	/// (as a single batch) instead of the current state event.
	pub fn subscribe_from(&self, job_id: JobId, after_sequence: u64) -> Result<Subscription> {
		self.inner.subscribe(job_id, Some(after_sequence))
	}

	#[must_use]
	pub fn subscriber_count(&self, job_id: JobId) -> usize {
		self.inner.lock_topics().get(&job_id).map_or(0, |topic| {
			topic
				.subscribers
				.iter()
				.filter(|subscriber| !subscriber.is_closed())
				.count()
		})
	}

	/// Drops the topics of jobs terminated longer than `retention` ago
	pub fn evict_terminated(&self, retention: Duration) -> usize {
		let now = Instant::now();
		let mut topics = self.inner.lock_topics();

		let before = topics.len();
		topics.retain(|_, topic| {
			topic
				.terminated
				.as_ref()
				.map_or(true, |(_, at)| now.duration_since(*at) <= retention)
		});
		let evicted = before - topics.len();

		if evicted > 0 {
			debug!(%evicted, "Evicted terminated job topics");
		}

		evicted
	}

	fn spawn_window(&self, job_id: JobId) {
		let inner = Arc::clone(&self.inner);

		spawn(
			async move {
				loop {
					sleep(inner.batch_window).await;
					if !inner.flush_window(job_id) {
						break;
					}
				}
			}
			.in_current_span(),
		);
	}
}

impl Inner {
	fn lock_topics(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, Topic>> {
		self.topics.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Returns `true` when a new batching window was opened and needs its timer
	fn enqueue(&self, topic: &mut Topic, event: ProgressEvent) -> bool {
		if topic.window_open {
			topic.pending.push(event);
			false
		} else {
			topic.window_open = true;
			self.deliver(topic, vec![event]);
			true
		}
	}

	/// Returns whether the window stays open for another period
	fn flush_window(&self, job_id: JobId) -> bool {
		let mut topics = self.lock_topics();

		let Some(topic) = topics.get_mut(&job_id) else {
			return false;
		};

		if topic.terminated.is_some() || topic.pending.is_empty() {
			topic.window_open = false;
			return false;
		}

		let pending = std::mem::take(&mut topic.pending);
		self.deliver(topic, pending);

		true
	}

	fn deliver(&self, topic: &mut Topic, events: Vec<ProgressEvent>) {
		self.send(topic, coalesce(events));
	}

	/// Fans `events` out as they are, without coalescing
	fn send(&self, topic: &mut Topic, events: Vec<ProgressEvent>) {
		self.remember(topic, &events);

		let Some(delivery) = Delivery::from_events(events) else {
			return;
		};

		topic.subscribers.retain(|subscriber| {
			match subscriber.force_send(delivery.clone()) {
				Ok(None) => true,
				Ok(Some(_dropped)) => {
					debug!("Subscriber queue full, dropped its oldest delivery");
					true
				}
				Err(_) => false,
			}
		});
	}

	fn remember(&self, topic: &mut Topic, events: &[ProgressEvent]) {
		for event in events {
			if topic.replay.len() >= self.replay_capacity {
				topic.replay.pop_front();
			}
			if self.replay_capacity > 0 {
				topic.replay.push_back(event.clone());
			}
		}

		if let Some(last) = events.last() {
			topic.last_delivered = Some(last.clone());
		}
	}

	fn subscribe(&self, job_id: JobId, after_sequence: Option<u64>) -> Result<Subscription> {
		let (tx, rx) = chan::bounded(self.subscriber_buffer);
		let mut topics = self.lock_topics();

		if !topics.contains_key(&job_id) {
			let record = self
				.registry
				.get(job_id)
				.ok_or(Error::JobNotFound(job_id))?;

			if record.status.is_terminal() {
				// Topic already evicted, the record still tells how the job ended
				let sequence = self.registry.final_sequence(job_id).unwrap_or_default();
				send_initial(&tx, vec![state_event(&record, sequence)]);
				tx.close();
				return Ok(Subscription::new(job_id, rx));
			}
		}

		let topic = topics.entry(job_id).or_insert_with(Topic::new);

		let initial = match after_sequence {
			Some(after) => topic
				.replay
				.iter()
				.filter(|event| event.sequence > after)
				.cloned()
				.collect(),
			None => match (&topic.terminated, &topic.last_delivered) {
				(Some((terminal, _)), _) => vec![terminal.clone()],
				(None, Some(last)) => vec![last.clone()],
				(None, None) => {
					let record = self
						.registry
						.get(job_id)
						.ok_or(Error::JobNotFound(job_id))?;
					vec![state_event(&record, 0)]
				}
			},
		};

		send_initial(&tx, initial);

		if topic.terminated.is_some() {
			tx.close();
		} else {
			topic.subscribers.push(tx);
		}

		trace!(%job_id, ?after_sequence, "New subscriber");

		Ok(Subscription::new(job_id, rx))
	}
}

fn send_initial(tx: &chan::Sender<Delivery>, events: Vec<ProgressEvent>) {
	if let Some(delivery) = Delivery::from_events(events) {
		// Fresh channel with a capacity of at least one, this can't fail
		let _ = tx.force_send(delivery);
	}
}

/// Current state of a job built from its record. `sequence` is `0` unless the job's
/// events were already evicted, then it's the sequence its terminal event had.
fn state_event(record: &JobRecord, sequence: u64) -> ProgressEvent {
	ProgressEvent {
		job_id: record.id,
		sequence,
		status: record.status,
		stale: record.stale,
		payload: None,
		error_detail: record.error_detail.clone(),
		result_summary: record.result_summary.clone(),
		emitted_at: Utc::now(),
	}
}

/// Keeps every event a later one can't make redundant, plus the last coalescable one
fn coalesce(events: Vec<ProgressEvent>) -> Vec<ProgressEvent> {
	let last_coalescable = events.iter().rposition(ProgressEvent::is_coalescable);

	events
		.into_iter()
		.enumerate()
		.filter(|(idx, event)| !event.is_coalescable() || Some(*idx) == last_coalescable)
		.map(|(_, event)| event)
		.collect()
}

/// Live stream of [`Delivery`] for a single job, ends after the terminal event.
///
/// The receiver is pinned on the heap so the subscription itself is `Unpin` and works
/// with `StreamExt::next`.
#[must_use = "a `Subscription` receives nothing unless polled"]
#[derive(Debug)]
pub struct Subscription {
	job_id: JobId,
	rx: Pin<Box<chan::Receiver<Delivery>>>,
}

impl Subscription {
	fn new(job_id: JobId, rx: chan::Receiver<Delivery>) -> Self {
		Self {
			job_id,
			rx: Box::pin(rx),
		}
	}

	#[must_use]
	pub const fn job_id(&self) -> JobId {
		self.job_id
	}

	/// Waits for the next delivery, `None` once the stream is closed and drained
	pub async fn recv(&self) -> Option<Delivery> {
		self.rx.recv().await.ok()
	}

	pub fn try_recv(&self) -> Option<Delivery> {
		self.rx.try_recv().ok()
	}

	#[must_use]
	pub fn is_closed(&self) -> bool {
		self.rx.is_closed()
	}
}

impl Stream for Subscription {
	type Item = Delivery;

	fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		self.rx.as_mut().poll_next(cx)
	}
}
