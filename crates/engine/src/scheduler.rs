//! Periodic sweep over due executions.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use nurture_core::config::SchedulerConfig;

use crate::executor::{StepExecutor, TickOutcome};
use crate::store::ExecutionStore;

/// Tally of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub due: usize,
    pub advanced: usize,
    pub waiting: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
    pub discarded: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: TickOutcome) {
        match outcome {
            TickOutcome::Advanced => self.advanced += 1,
            TickOutcome::Waiting => self.waiting += 1,
            TickOutcome::Retrying => self.retrying += 1,
            TickOutcome::Completed => self.completed += 1,
            TickOutcome::Failed => self.failed += 1,
            TickOutcome::Discarded => self.discarded += 1,
            TickOutcome::Skipped => self.skipped += 1,
        }
    }

    pub fn processed(&self) -> usize {
        self.due - self.skipped - self.errors
    }
}

pub struct Scheduler {
    executions: Arc<ExecutionStore>,
    executor: Arc<StepExecutor>,
    sweep_interval: StdDuration,
    batch_size: usize,
    max_parallel_ticks: usize,
}

impl Scheduler {
    pub fn new(executions: Arc<ExecutionStore>, executor: Arc<StepExecutor>, config: &SchedulerConfig) -> Self {
        Self {
            executions,
            executor,
            sweep_interval: StdDuration::from_millis(config.sweep_interval_ms.max(1)),
            batch_size: config.batch_size.max(1),
            max_parallel_ticks: config.max_parallel_ticks.max(1),
        }
    }

    /// Ticks every execution due at `now`, at most `batch_size` of them.
    ///
    /// Executions that a tick leaves due again (e.g. an advance with no
    /// delay) are picked up by the next sweep, so one sweep moves each
    /// execution by at most one node.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let due = self.executions.due(now, self.batch_size);
        let mut report = SweepReport {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return report;
        }

        let results: Vec<_> = stream::iter(due)
            .map(|id| async move { (id, self.executor.tick(id, now).await) })
            .buffer_unordered(self.max_parallel_ticks)
            .collect()
            .await;

        for (id, result) in results {
            match result {
                Ok(outcome) => report.record(outcome),
                Err(err) => {
                    error!(execution_id = %id, error = %err, "Tick failed");
                    report.errors += 1;
                }
            }
        }

        metrics::histogram!("nurture.sweep.due").record(report.due as f64);
        debug!(?report, "Sweep finished");
        report
    }

    /// Sweeps on a fixed interval until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            interval_ms = self.sweep_interval.as_millis() as u64,
            batch_size = self.batch_size,
            parallelism = self.max_parallel_ticks,
            "Scheduler started"
        );
        let mut interval = tokio::time::interval(self.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Scheduler stopping");
                    break;
                }
                _ = interval.tick() => {
                    self.sweep(Utc::now()).await;
                }
            }
        }
    }
}
