//!
//! # Job Orchestrator
//!
//! Spacedrive's Job Orchestrator runs long-lived background jobs (crawls, uploads, refreshes)
//! and keeps any number of observers in sync with their progress.
//!
//! Bring an executor, the orchestrator handles the rest:
//! - A single compare-and-swap gate for every status change, so a stop request racing a
//!   natural completion always ends in exactly one terminal status;
//! - Cooperative cancellation bounded by a grace period, jobs never stay `Stopping` forever;
//! - Progress fan-out with deduplication, leading-edge batching and per-subscriber bounded
//!   queues, terminal events always delivered and always last;
//! - Advisory detection of silent jobs;
//! - A client side reconciler to avoid re-applying server echoes of optimistic changes.
//!
//!
//! ## Basic example
//!
//! ```
//! use sd_job_orchestrator::{
//!     check_interruption, ExecStatus, JobContext, JobOrchestrator, JobStatus, OrchestratorConfig,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let orchestrator = JobOrchestrator::new(OrchestratorConfig::default());
//!
//!     let job_id = orchestrator
//!         .start("crawl", json!({"url": "https://spacedrive.com"}), |ctx: JobContext| async move {
//!             for page in 1..=3 {
//!                 check_interruption!(ctx.interrupter());
//!                 ctx.reporter().discrete(json!({"page": page}))?;
//!             }
//!
//!             anyhow::Ok(ExecStatus::Done(Some(json!({"pages": 3}))))
//!         })
//!         .unwrap();
//!
//!     let subscription = orchestrator.subscribe(job_id).unwrap();
//!     let mut last_status = None;
//!     while let Some(delivery) = subscription.recv().await {
//!         last_status = delivery.last().map(|event| event.status);
//!     }
//!
//!     assert_eq!(last_status, Some(JobStatus::Completed));
//!     assert_eq!(
//!         orchestrator.status(job_id).unwrap().result_summary,
//!         Some(json!({"pages": 3}))
//!     );
//!
//!     orchestrator.shutdown().await;
//! }
//! ```

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod broadcast;
mod cancel;
mod config;
mod error;
mod job;
mod orchestrator;
mod reconciler;
mod registry;
mod watchdog;

pub use broadcast::{ProgressBroadcaster, Subscription};
pub use cancel::{CancellationCoordinator, Interrupter, InterrupterFuture, StopOutcome};
pub use config::{CancelTimeoutPolicy, OrchestratorConfig};
pub use error::{Error, FailureReason, Result};
pub use job::{
	Delivery, JobFilter, JobId, JobRecord, JobStatus, Payload, ProgressEvent, Termination,
};
pub use orchestrator::{ExecStatus, Executor, JobContext, JobOrchestrator, ProgressReporter};
pub use reconciler::{ClientReconciler, EventCursor, PendingOptimisticChange};
pub use registry::JobRegistry;
pub use watchdog::StaleWatchdog;
