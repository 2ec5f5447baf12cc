use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use super::{
	broadcast::ProgressBroadcaster,
	job::{JobId, JobRecord},
	registry::JobRegistry,
};

/// Advisory detector for running jobs that stopped reporting progress.
///
/// A stale job keeps its `Running` status, it only gets its `stale` flag raised and a
/// progress event announcing it. The next accepted publish clears the flag. Deciding
/// whether to stop such a job is up to whoever watches those events.
#[derive(Debug, Clone)]
pub struct StaleWatchdog {
	registry: JobRegistry,
	broadcaster: ProgressBroadcaster,
	timeout: Duration,
}

impl StaleWatchdog {
	#[must_use]
	pub const fn new(
		registry: JobRegistry,
		broadcaster: ProgressBroadcaster,
		timeout: Duration,
	) -> Self {
		Self {
			registry,
			broadcaster,
			timeout,
		}
	}

	/// Flags and announces running jobs silent for longer than the timeout, returning the
	/// ones flagged by this scan
	pub fn scan(&self) -> Vec<JobId> {
		self.registry
			.mark_stale(self.timeout)
			.iter()
			.map(|record| {
				self.announce(record);
				record.id
			})
			.collect()
	}

	fn announce(&self, record: &JobRecord) {
		warn!(
			job_id = %record.id,
			kind = %record.kind,
			last_progress_at = %record.last_progress_at,
			"Job has not reported progress in a while"
		);

		self.broadcaster.announce_stale(record);
	}

	/// Scans every `period` until `stop` is cancelled. The period doesn't depend on how
	/// many jobs there are.
	pub async fn run(self, period: Duration, stop: CancellationToken) {
		let mut ticker = interval(period);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

		loop {
			tokio::select! {
				() = stop.cancelled() => {
					trace!("Stale watchdog stopping");
					break;
				}
				_ = ticker.tick() => {
					self.scan();
				}
			}
		}
	}
}
