//! Long-running sync scheduler.
//!
//! `docsync watch` keeps every mapping on its own clock: a mapping runs as
//! soon as the watcher starts and again each time its `sync_interval`
//! elapses after the previous run finished. Mappings are run one at a time
//! in due order, so a slow mapping delays the others but never overlaps
//! itself.
//!
//! Cancelling the token stops the scheduler. A cycle in progress finishes
//! its in-flight applies and is reported before [`watch`] returns.

use tokio::time::{Duration, Instant};

use crate::report::MappingReport;
use crate::sync::{Binding, CancellationToken, Orchestrator, SyncOptions};

/// Next-due bookkeeping for a fixed set of mappings.
#[derive(Debug)]
pub struct Schedule {
    intervals: Vec<Duration>,
    due: Vec<Instant>,
}

impl Schedule {
    /// Every mapping is due at `now`.
    pub fn new(intervals: Vec<Duration>, now: Instant) -> Self {
        let due = vec![now; intervals.len()];
        Self { intervals, due }
    }

    /// The mapping due soonest; ties go to the earlier index.
    pub fn next(&self) -> Option<(usize, Instant)> {
        self.due
            .iter()
            .copied()
            .enumerate()
            .min_by_key(|(i, at)| (*at, *i))
    }

    pub fn completed(&mut self, index: usize, finished: Instant) {
        self.due[index] = finished + self.intervals[index];
    }
}

/// Run `bindings` on their intervals until `cancel` fires, handing each
/// mapping report to `on_report` as it completes.
pub async fn watch<F>(
    orchestrator: &Orchestrator,
    bindings: &[Binding],
    cancel: &CancellationToken,
    options: SyncOptions,
    mut on_report: F,
) where
    F: FnMut(MappingReport),
{
    let intervals = bindings.iter().map(|b| b.mapping.sync_interval).collect();
    let mut schedule = Schedule::new(intervals, Instant::now());

    tracing::info!(mappings = bindings.len(), "watching");
    while let Some((index, due)) = schedule.next() {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(due) => {}
        }

        let binding = &bindings[index];
        let report = orchestrator.sync_mapping(binding, cancel, options).await;
        schedule.completed(index, Instant::now());
        tracing::debug!(
            mapping = %binding.mapping.name,
            next_in_secs = binding.mapping.sync_interval.as_secs(),
            "scheduled"
        );
        on_report(report);

        if cancel.is_cancelled() {
            break;
        }
    }
    tracing::info!("watch stopped");
}
