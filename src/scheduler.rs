//! Periodic task loops.
//!
//! One loop per [`TaskKind`], each on its own `tokio::time::interval`. A loop
//! awaits every run before waiting for the next tick, and missed ticks are
//! skipped, so a slow run delays its task instead of queueing a burst.
//! Cancellation is checked between runs only.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::orchestrator::{Orchestrator, SyncError, TaskKind};

/// Runs every task at its interval until `shutdown` is cancelled.
#[derive(Debug)]
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    intervals: Vec<(TaskKind, Duration)>,
}

impl Scheduler {
    /// Creates a scheduler; `interval` gives the period of each task.
    pub fn new(orchestrator: Arc<Orchestrator>, interval: impl Fn(TaskKind) -> Duration) -> Self {
        let intervals = TaskKind::ALL
            .into_iter()
            .map(|kind| (kind, interval(kind)))
            .collect();
        Self {
            orchestrator,
            intervals,
        }
    }

    /// Spawns the loops and waits for all of them to stop.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut loops = JoinSet::new();
        for (kind, period) in self.intervals {
            let orchestrator = Arc::clone(&self.orchestrator);
            let shutdown = shutdown.clone();
            loops.spawn(task_loop(orchestrator, kind, period, shutdown));
        }
        info!(tasks = loops.len(), "scheduler started");

        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "task loop aborted");
            }
        }
        info!("scheduler stopped");
    }
}

async fn task_loop(
    orchestrator: Arc<Orchestrator>,
    kind: TaskKind,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!(task = %kind, ?period, "task loop started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match orchestrator.trigger(kind).await {
            Ok(report) => debug!(task = %kind, ?report, "task run finished"),
            Err(SyncError::Busy(_)) => debug!(task = %kind, "previous run still in progress"),
            Err(e) => error!(task = %kind, error = %e, "task run failed"),
        }
    }
    debug!(task = %kind, "task loop stopped");
}

