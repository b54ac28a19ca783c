//! Worker handles and the per-worker bookkeeping kept by schedulers.
//!
//! A worker is any remote process able to run batches of items referenced
//! by their collection index. Workers are expected to hold on to their final
//! pending item until either more work or a shutdown signal arrives; the
//! schedulers rely on this to keep at least one item queued behind the one
//! being executed.

use indexmap::IndexMap;
use std::fmt::Debug;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::types::{ItemIndex, WorkItem, WorkerId};

/// Capability used by schedulers to drive a remote worker.
pub trait WorkerHandle: Send + Sync + Debug {
    /// Stable identifier of the worker.
    fn id(&self) -> &str;

    /// Ask the worker to run the given items, in order.
    fn send_batch(&self, indices: &[ItemIndex]);

    /// Ask the worker to finish its pending items and exit.
    fn shutdown(&self);
}

/// Command delivered to a [`ChannelWorker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCommand {
    Run(Vec<ItemIndex>),
    Shutdown,
}

/// A [`WorkerHandle`] that forwards commands over an in-process channel.
#[derive(Debug, Clone)]
pub struct ChannelWorker {
    id: WorkerId,
    sender: mpsc::UnboundedSender<WorkerCommand>,
}

impl ChannelWorker {
    pub fn new(id: impl Into<WorkerId>) -> (Self, mpsc::UnboundedReceiver<WorkerCommand>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                id: id.into(),
                sender,
            },
            receiver,
        )
    }

    fn deliver(&self, command: WorkerCommand) {
        if self.sender.send(command).is_err() {
            warn!("Worker {} is gone, dropping command", self.id);
        }
    }
}

impl WorkerHandle for ChannelWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn send_batch(&self, indices: &[ItemIndex]) {
        self.deliver(WorkerCommand::Run(indices.to_vec()));
    }

    fn shutdown(&self) {
        self.deliver(WorkerCommand::Shutdown);
    }
}

/// Scheduler-side view of a worker: its handle, the items it is believed to
/// be running (in send order) and whether it was told to shut down.
#[derive(Debug)]
pub struct WorkerProxy {
    handle: Box<dyn WorkerHandle>,
    pending: IndexMap<ItemIndex, WorkItem>,
    shutting_down: bool,
}

impl WorkerProxy {
    pub fn new(handle: Box<dyn WorkerHandle>) -> Self {
        Self {
            handle,
            pending: IndexMap::new(),
            shutting_down: false,
        }
    }

    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Item the worker is executing right now.
    pub fn head(&self) -> Option<&WorkItem> {
        self.pending.first().map(|(_, item)| item)
    }

    /// Item the worker will execute last.
    pub fn tail(&self) -> Option<&WorkItem> {
        self.pending.last().map(|(_, item)| item)
    }

    pub fn pending_items(&self) -> impl Iterator<Item = &WorkItem> {
        self.pending.values()
    }

    /// Send `items` to the worker and track them as pending.
    pub fn send(&mut self, items: Vec<WorkItem>) {
        if items.is_empty() {
            return;
        }
        debug_assert!(!self.shutting_down, "sending work to a worker shutting down");
        let indices: Vec<ItemIndex> = items.iter().map(|item| item.index).collect();
        debug!("Sending {} items to worker {}", indices.len(), self.id());
        self.handle.send_batch(&indices);
        for item in items {
            self.pending.insert(item.index, item);
        }
    }

    /// Record completion of `index`, which must be the head pending item.
    pub fn complete(&mut self, index: ItemIndex) -> WorkItem {
        let head = self.pending.first().map(|(idx, _)| *idx);
        assert_eq!(
            head,
            Some(index),
            "worker {} completed item {} out of order (head is {:?})",
            self.id(),
            index,
            head
        );
        match self.pending.shift_remove_index(0) {
            Some((_, item)) => item,
            None => unreachable!("head checked above"),
        }
    }

    /// Send the shutdown signal once; later calls are no-ops.
    pub fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        debug!("Shutting down worker {}", self.id());
        self.shutting_down = true;
        self.handle.shutdown();
    }

    /// Forget every pending item, returning them in send order.
    pub fn release_pending(&mut self) -> Vec<WorkItem> {
        self.pending.drain(..).map(|(_, item)| item).collect()
    }
}

/// Registered workers, split between those admitted to scheduling and
/// those still waiting for their collection to be validated.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    active: IndexMap<WorkerId, WorkerProxy>,
    waiting: IndexMap<WorkerId, WorkerProxy>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker; it starts out waiting unless `admit` is set.
    pub fn register(&mut self, handle: Box<dyn WorkerHandle>, admit: bool) -> SchedulerResult<()> {
        let id = handle.id().to_string();
        if self.contains(&id) {
            return Err(SchedulerError::DuplicateWorker(id));
        }
        let proxy = WorkerProxy::new(handle);
        if admit {
            self.active.insert(id, proxy);
        } else {
            self.waiting.insert(id, proxy);
        }
        Ok(())
    }

    /// Move a waiting worker to the active set. Returns false if it was not waiting.
    pub fn admit(&mut self, id: &str) -> bool {
        match self.waiting.shift_remove(id) {
            Some(proxy) => {
                self.active.insert(id.to_string(), proxy);
                true
            }
            None => false,
        }
    }

    /// Unregister a worker, telling whether it had been admitted.
    pub fn remove(&mut self, id: &str) -> Option<(WorkerProxy, bool)> {
        if let Some(proxy) = self.active.shift_remove(id) {
            return Some((proxy, true));
        }
        self.waiting.shift_remove(id).map(|proxy| (proxy, false))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.active.contains_key(id) || self.waiting.contains_key(id)
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.active.contains_key(id)
    }

    pub fn active(&self) -> impl Iterator<Item = &WorkerProxy> {
        self.active.values()
    }

    pub fn active_mut(&mut self) -> impl Iterator<Item = &mut WorkerProxy> {
        self.active.values_mut()
    }

    pub fn active_ids(&self) -> Vec<WorkerId> {
        self.active.keys().cloned().collect()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn get_active(&self, id: &str) -> Option<&WorkerProxy> {
        self.active.get(id)
    }

    pub fn get_active_mut(&mut self, id: &str) -> Option<&mut WorkerProxy> {
        self.active.get_mut(id)
    }

    /// Active workers first, then waiting ones, each in registration order.
    pub fn ids(&self) -> Vec<WorkerId> {
        self.active.keys().chain(self.waiting.keys()).cloned().collect()
    }

    /// Shut down every registered worker.
    pub fn shutdown_all(&mut self) {
        for proxy in self.active.values_mut().chain(self.waiting.values_mut()) {
            proxy.shutdown();
        }
    }
}
