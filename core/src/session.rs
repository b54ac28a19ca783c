//! Session driver
//!
//! Owns a scheduler for the duration of a test run and feeds it the events
//! reported by workers, one at a time, in arrival order.

use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::collection::CollectionMismatch;
use crate::error::SchedulerResult;
use crate::scheduler::Scheduler;
use crate::types::{ItemIndex, WorkerId};
use crate::worker::WorkerHandle;

/// Something a worker reported.
#[derive(Debug)]
pub enum SessionEvent {
    /// A worker came up and can receive commands.
    WorkerReady(Box<dyn WorkerHandle>),
    /// A worker finished collecting.
    CollectionFinished { worker: WorkerId, items: Vec<String> },
    /// A worker finished running an item.
    ItemComplete {
        worker: WorkerId,
        item_index: ItemIndex,
        duration: Duration,
    },
    /// A worker exited, gracefully or not.
    WorkerDown { worker: WorkerId },
}

/// Something the session wants the outside world to know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionReport {
    CollectionMismatch(CollectionMismatch),
    /// The worker went down while `item` was in flight.
    WorkerCrashed { worker: WorkerId, item: String },
    /// Every item has been handed out; workers were told to shut down.
    Finished,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub workers_seen: usize,
    pub items_completed: usize,
    pub mismatches: usize,
    pub crashed: Vec<(WorkerId, String)>,
    pub finished: bool,
}

#[derive(Debug)]
pub struct Session {
    scheduler: Box<dyn Scheduler>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    reports: mpsc::UnboundedSender<SessionReport>,
    summary: SessionSummary,
}

impl Session {
    pub fn new(
        scheduler: Box<dyn Scheduler>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        reports: mpsc::UnboundedSender<SessionReport>,
    ) -> Self {
        Self {
            scheduler,
            events,
            reports,
            summary: SessionSummary::default(),
        }
    }

    /// Process events until every worker that joined has gone down with no
    /// work left, or the event channel closes.
    ///
    /// While items are still queued the session keeps waiting for
    /// replacement workers.
    pub async fn run(mut self) -> SessionSummary {
        info!("Session started with {} scheduling", self.scheduler.mode());
        while let Some(event) = self.events.recv().await {
            if let Err(e) = self.handle(event) {
                warn!("Dropping event: {}", e);
            }
            if self.summary.workers_seen > 0 && self.scheduler.workers().is_empty() {
                if !self.scheduler.has_pending_work() {
                    info!("All workers are down");
                    break;
                }
                warn!("All workers are down with work left, waiting for replacements");
            }
        }
        if !self.summary.finished {
            warn!(
                "Session ended before all work finished ({} items completed)",
                self.summary.items_completed
            );
        }
        self.summary
    }

    fn handle(&mut self, event: SessionEvent) -> SchedulerResult<()> {
        match event {
            SessionEvent::WorkerReady(handle) => {
                self.scheduler.add_worker(handle)?;
                self.summary.workers_seen += 1;
            }
            SessionEvent::CollectionFinished { worker, items } => {
                let mismatches = self.scheduler.add_worker_collection(&worker, items)?;
                for mismatch in mismatches {
                    error!("{}", mismatch);
                    self.summary.mismatches += 1;
                    self.report(SessionReport::CollectionMismatch(mismatch));
                }
                if self.scheduler.is_collection_complete() && !self.summary.finished {
                    self.scheduler.schedule();
                    self.check_finished();
                }
            }
            SessionEvent::ItemComplete {
                worker,
                item_index,
                duration,
            } => {
                self.scheduler
                    .mark_item_complete(&worker, item_index, duration)?;
                self.summary.items_completed += 1;
                self.check_finished();
            }
            SessionEvent::WorkerDown { worker } => {
                if let Some(item) = self.scheduler.remove_worker(&worker)? {
                    warn!("Worker {} crashed while running {}", worker, item);
                    self.summary.crashed.push((worker.clone(), item.clone()));
                    self.report(SessionReport::WorkerCrashed { worker, item });
                }
                self.check_finished();
            }
        }
        Ok(())
    }

    /// Shut every worker down once nothing is left to schedule.
    fn check_finished(&mut self) {
        if self.summary.finished || !self.scheduler.all_work_finished() {
            return;
        }
        info!("All work handed out, shutting down workers");
        self.summary.finished = true;
        self.scheduler.shutdown_all();
        self.report(SessionReport::Finished);
    }

    fn report(&self, report: SessionReport) {
        if self.reports.send(report).is_err() {
            debug!("Report receiver dropped");
        }
    }
}
