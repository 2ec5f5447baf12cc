use sd_job_orchestrator::{check_interruption, ExecStatus, Executor, JobContext};

use std::{future::IntoFuture, sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde_json::json;
use tokio::{sync::Notify, time::sleep};
use tracing::info;

/// Runs until its job is asked to stop
#[derive(Debug, Default)]
pub struct NeverExecutor;

#[async_trait]
impl Executor for NeverExecutor {
	async fn run(&mut self, ctx: &JobContext) -> anyhow::Result<ExecStatus> {
		ctx.interrupter().await;
		info!("Canceling NeverExecutor <id='{}'>", ctx.id());
		Ok(ExecStatus::Canceled)
	}
}

/// Reports `steps` percentages, `delay` apart, checking for interruption before each one
#[derive(Debug)]
pub struct ProgressExecutor {
	pub steps: u64,
	pub delay: Duration,
}

#[async_trait]
impl Executor for ProgressExecutor {
	async fn run(&mut self, ctx: &JobContext) -> anyhow::Result<ExecStatus> {
		for step in 1..=self.steps {
			check_interruption!(ctx.interrupter());

			ctx.reporter()
				.snapshot(json!({"percent": step * 100 / self.steps}))?;

			if !self.delay.is_zero() {
				sleep(self.delay).await;
			}
		}

		Ok(ExecStatus::Done(Some(json!({"steps": self.steps}))))
	}
}

/// Ignores cancellation and finishes after `work`
#[derive(Debug)]
pub struct StubbornExecutor {
	pub work: Duration,
}

#[async_trait]
impl Executor for StubbornExecutor {
	async fn run(&mut self, ctx: &JobContext) -> anyhow::Result<ExecStatus> {
		sleep(self.work).await;
		info!("StubbornExecutor <id='{}'> done, finally", ctx.id());
		Ok(ExecStatus::Done(None))
	}
}

/// Completes when `gate` is notified, or cancels if asked to first
#[derive(Debug)]
pub struct GatedExecutor {
	pub gate: Arc<Notify>,
}

#[async_trait]
impl Executor for GatedExecutor {
	async fn run(&mut self, ctx: &JobContext) -> anyhow::Result<ExecStatus> {
		tokio::select! {
			() = self.gate.notified() => Ok(ExecStatus::Done(Some(json!("gate opened")))),
			() = ctx.interrupter().into_future() => Ok(ExecStatus::Canceled),
		}
	}
}

#[derive(Debug)]
pub struct BrokenExecutor;

#[async_trait]
impl Executor for BrokenExecutor {
	async fn run(&mut self, ctx: &JobContext) -> anyhow::Result<ExecStatus> {
		let page = 3;

		Err(anyhow!("connection reset by peer"))
			.with_context(|| format!("fetching page {page} of job {}", ctx.kind()))
	}
}

#[derive(Debug)]
pub struct PanicExecutor;

#[async_trait]
impl Executor for PanicExecutor {
	async fn run(&mut self, _ctx: &JobContext) -> anyhow::Result<ExecStatus> {
		panic!("executor exploded");
	}
}
