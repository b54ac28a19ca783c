//! Test doubles for driving schedulers without real worker processes.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::types::{ItemIndex, WorkerId};
use crate::worker::WorkerHandle;

#[derive(Debug, Default)]
struct WorkerLog {
    batches: Vec<Vec<ItemIndex>>,
    shutdowns: usize,
}

/// A [`WorkerHandle`] that records every command it receives.
#[derive(Debug)]
pub struct RecordingWorker {
    id: WorkerId,
    log: Arc<Mutex<WorkerLog>>,
}

/// Read side of a [`RecordingWorker`], kept by the test after the handle
/// has been moved into a scheduler.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    id: WorkerId,
    log: Arc<Mutex<WorkerLog>>,
}

impl RecordingWorker {
    pub fn new(id: impl Into<WorkerId>) -> (Self, WorkerRecord) {
        let id = id.into();
        let log = Arc::new(Mutex::new(WorkerLog::default()));
        (
            Self {
                id: id.clone(),
                log: log.clone(),
            },
            WorkerRecord { id, log },
        )
    }

    /// Boxed handle plus record, the shape `add_worker` wants.
    pub fn boxed(id: impl Into<WorkerId>) -> (Box<dyn WorkerHandle>, WorkerRecord) {
        let (worker, record) = Self::new(id);
        (Box::new(worker), record)
    }
}

fn lock(log: &Mutex<WorkerLog>) -> MutexGuard<'_, WorkerLog> {
    log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl WorkerHandle for RecordingWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn send_batch(&self, indices: &[ItemIndex]) {
        lock(&self.log).batches.push(indices.to_vec());
    }

    fn shutdown(&self) {
        lock(&self.log).shutdowns += 1;
    }
}

impl WorkerRecord {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Batches in the order they were sent.
    pub fn batches(&self) -> Vec<Vec<ItemIndex>> {
        lock(&self.log).batches.clone()
    }

    /// Every index ever sent, flattened in send order.
    pub fn sent(&self) -> Vec<ItemIndex> {
        lock(&self.log).batches.iter().flatten().copied().collect()
    }

    pub fn shutdown_count(&self) -> usize {
        lock(&self.log).shutdowns
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown_count() > 0
    }
}
