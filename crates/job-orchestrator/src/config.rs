use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::Error;

/// What the orchestrator does with an executor that outlived its cancellation grace period.
///
/// The registry is failed with a cancellation timeout either way, this only decides the
/// fate of the in-process task. Anything living outside the process (a child process, a
/// remote crawl) is the caller's business.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelTimeoutPolicy {
	/// Leave the task running, its late result is ignored
	#[default]
	Detach,
	/// Abort the tokio task at its next yield point
	Abort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
	pub dedup_window_ms: u64,
	pub batch_window_ms: u64,
	pub stale_timeout_ms: u64,
	pub watchdog_interval_ms: u64,
	pub stop_grace_period_ms: u64,
	/// Per subscriber queue size, the oldest deliveries are dropped past it
	pub subscriber_buffer: usize,
	/// Delivered events kept per job for subscribers that reconnect
	pub replay_capacity: usize,
	/// How long a terminated job's events stay around for late subscribers
	pub event_retention_ms: u64,
	/// Terminal records are kept for the process lifetime when unset
	pub record_retention_ms: Option<u64>,
	pub on_cancel_timeout: CancelTimeoutPolicy,
}

impl Default for OrchestratorConfig {
	fn default() -> Self {
		Self {
			dedup_window_ms: 100,
			batch_window_ms: 500,
			stale_timeout_ms: 120_000,
			watchdog_interval_ms: 5_000,
			stop_grace_period_ms: 10_000,
			subscriber_buffer: 64,
			replay_capacity: 32,
			event_retention_ms: 60_000,
			record_retention_ms: None,
			on_cancel_timeout: CancelTimeoutPolicy::Detach,
		}
	}
}

impl OrchestratorConfig {
	pub fn from_toml_str(raw: &str) -> Result<Self, Error> {
		toml::from_str(raw).map_err(Into::into)
	}

	#[must_use]
	pub const fn dedup_window(&self) -> Duration {
		Duration::from_millis(self.dedup_window_ms)
	}

	#[must_use]
	pub const fn batch_window(&self) -> Duration {
		Duration::from_millis(self.batch_window_ms)
	}

	#[must_use]
	pub const fn stale_timeout(&self) -> Duration {
		Duration::from_millis(self.stale_timeout_ms)
	}

	#[must_use]
	pub const fn watchdog_interval(&self) -> Duration {
		Duration::from_millis(self.watchdog_interval_ms)
	}

	#[must_use]
	pub const fn stop_grace_period(&self) -> Duration {
		Duration::from_millis(self.stop_grace_period_ms)
	}

	#[must_use]
	pub const fn event_retention(&self) -> Duration {
		Duration::from_millis(self.event_retention_ms)
	}

	#[must_use]
	pub fn record_retention(&self) -> Option<Duration> {
		self.record_retention_ms.map(Duration::from_millis)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn partial_toml_keeps_defaults() {
		let config = OrchestratorConfig::from_toml_str(
			r#"
			batch_window_ms = 250
			record_retention_ms = 3600000
			on_cancel_timeout = "abort"
			"#,
		)
		.unwrap();

		assert_eq!(config.batch_window(), Duration::from_millis(250));
		assert_eq!(config.record_retention(), Some(Duration::from_secs(3600)));
		assert_eq!(config.on_cancel_timeout, CancelTimeoutPolicy::Abort);
		assert_eq!(config.dedup_window(), Duration::from_millis(100));
		assert_eq!(config.stale_timeout(), Duration::from_secs(120));
	}

	#[test]
	fn empty_toml_is_default() {
		assert_eq!(
			OrchestratorConfig::from_toml_str("").unwrap(),
			OrchestratorConfig::default()
		);
	}

	#[test]
	fn unknown_policy_is_a_config_error() {
		assert!(matches!(
			OrchestratorConfig::from_toml_str(r#"on_cancel_timeout = "kill""#),
			Err(Error::Config(_))
		));
	}
}
