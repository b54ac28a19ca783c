//! Common test utilities and helpers for integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::time::Duration;
use testfan_core::grouping::scope_of;
use testfan_core::testing::{RecordingWorker, WorkerRecord};
use testfan_core::{DistMode, ItemIndex, Scheduler, SchedulerBuilder, SchedulerConfig};

/// Build a boxed scheduler with a fixed seed
pub fn scheduler(mode: DistMode, workers: usize) -> Box<dyn Scheduler> {
    SchedulerBuilder::new(SchedulerConfig::new(mode, workers).with_seed(7))
        .build()
        .unwrap()
}

/// `count` items for each `(scope, count)` pair, in order
pub fn scoped_items(scopes: &[(&str, usize)]) -> Vec<String> {
    scopes
        .iter()
        .flat_map(|(scope, count)| (0..*count).map(move |i| format!("{}::test_{}", scope, i)))
        .collect()
}

/// A simulated worker that mirrors what its handle received.
///
/// Like a real worker it holds its last pending item until more work or a
/// shutdown arrives.
#[derive(Debug)]
pub struct SimWorker {
    pub record: WorkerRecord,
    seen_batches: usize,
    pub pending: VecDeque<ItemIndex>,
    pub completed: Vec<ItemIndex>,
}

impl SimWorker {
    fn sync(&mut self) {
        let batches = self.record.batches();
        for batch in &batches[self.seen_batches..] {
            self.pending.extend(batch.iter().copied());
        }
        self.seen_batches = batches.len();
    }

    /// Whether the worker is executing its head item right now.
    pub fn is_running(&self) -> bool {
        self.pending.len() >= 2 || (self.record.is_shut_down() && !self.pending.is_empty())
    }

    pub fn id(&self) -> &str {
        self.record.id()
    }
}

/// Drives a scheduler with simulated workers, one completion at a time.
#[derive(Debug)]
pub struct Cluster {
    pub scheduler: Box<dyn Scheduler>,
    pub workers: Vec<SimWorker>,
    pub crashed: Vec<String>,
    retired: Vec<ItemIndex>,
    next: usize,
}

impl Cluster {
    pub fn new(scheduler: Box<dyn Scheduler>) -> Self {
        Self {
            scheduler,
            workers: Vec::new(),
            crashed: Vec::new(),
            retired: Vec::new(),
            next: 0,
        }
    }

    /// Register a worker without reporting its collection.
    pub fn join(&mut self, id: &str) {
        let (handle, record) = RecordingWorker::boxed(id);
        self.scheduler.add_worker(handle).unwrap();
        self.workers.push(SimWorker {
            record,
            seen_batches: 0,
            pending: VecDeque::new(),
            completed: Vec::new(),
        });
    }

    /// Register workers, report the same collection for each and schedule.
    pub fn start(&mut self, ids: &[&str], items: &[String]) {
        for id in ids {
            self.join(id);
        }
        for id in ids {
            let mismatches = self
                .scheduler
                .add_worker_collection(id, items.to_vec())
                .unwrap();
            assert!(mismatches.is_empty());
        }
        assert!(self.scheduler.is_collection_complete());
        self.scheduler.schedule();
        self.sync();
    }

    pub fn sync(&mut self) {
        for worker in &mut self.workers {
            worker.sync();
        }
    }

    pub fn worker(&self, id: &str) -> &SimWorker {
        self.workers.iter().find(|w| w.id() == id).unwrap()
    }

    /// Complete the head item of `id`.
    pub fn complete(&mut self, id: &str, duration: Duration) -> ItemIndex {
        let worker = self.workers.iter_mut().find(|w| w.id() == id).unwrap();
        let index = worker.pending.pop_front().unwrap();
        worker.completed.push(index);
        self.scheduler
            .mark_item_complete(id, index, duration)
            .unwrap();
        self.sync();
        index
    }

    /// Complete one item on the next running worker, round robin.
    /// Returns false when no worker is running.
    pub fn step(&mut self) -> bool {
        let count = self.workers.len();
        for offset in 0..count {
            let position = (self.next + offset) % count;
            if self.workers[position].is_running() {
                self.next = position + 1;
                let id = self.workers[position].id().to_string();
                self.complete(&id, Duration::from_millis(1));
                return true;
            }
        }
        false
    }

    /// Remove `id` as if its process died.
    pub fn crash(&mut self, id: &str) -> Option<String> {
        let position = self.workers.iter().position(|w| w.id() == id).unwrap();
        let worker = self.workers.remove(position);
        self.retired.extend(worker.completed);
        let crashed = self.scheduler.remove_worker(id).unwrap();
        if let Some(item) = &crashed {
            self.crashed.push(item.clone());
        }
        self.sync();
        crashed
    }

    /// Scopes of the items being executed right now.
    pub fn running_scopes(&self) -> Vec<String> {
        let collection = self.scheduler.collection().unwrap_or_default();
        let mut scopes: Vec<String> = self
            .workers
            .iter()
            .filter(|w| w.is_running())
            .filter_map(|w| w.pending.front())
            .map(|index| scope_of(&collection[*index]).to_string())
            .collect();
        scopes.sort();
        scopes.dedup();
        scopes
    }

    /// Run until nothing is left, calling `check` before every completion.
    pub fn run_with(&mut self, mut check: impl FnMut(&Cluster)) {
        let mut shutdown_sent = false;
        for _ in 0..100_000 {
            check(self);
            if self.step() {
                continue;
            }
            if !shutdown_sent && self.scheduler.all_work_finished() {
                self.scheduler.shutdown_all();
                self.sync();
                shutdown_sent = true;
                continue;
            }
            break;
        }
        assert!(
            !self.scheduler.has_pending_work(),
            "stalled with pending work: {:?}",
            self.workers
        );
    }

    pub fn run(&mut self) {
        self.run_with(|_| {});
    }

    /// Every completed index, including those of crashed workers, sorted.
    pub fn completed(&self) -> Vec<ItemIndex> {
        let mut all: Vec<ItemIndex> = self
            .workers
            .iter()
            .flat_map(|w| w.completed.iter().copied())
            .chain(self.retired.iter().copied())
            .collect();
        all.sort_unstable();
        all
    }
}

pub fn index_of(items: &[String], id: &str) -> ItemIndex {
    items.iter().position(|item| item == id).unwrap()
}
