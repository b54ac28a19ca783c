//! Load-balancing schedulers
//!
//! One implementation backs the plain `load` policy and its grouping
//! variants (`loadscope`, `loadfile`, `loadgroup`), the randomized
//! `loadscopeshuffled` policy and the `singlecollect` policy. They differ in
//! how item ids map to groups, in how the next group is picked and in whose
//! collection is trusted.
//!
//! Groups are never split: a worker always receives every item of a group.
//! Workers start with a chunk of roughly a quarter of their fair share and
//! are refilled between a low and a high water mark as they complete items.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::Scheduler;
use crate::collection::{CollectionMismatch, CollectionValidator};
use crate::config::{DistMode, SchedulerConfig};
use crate::error::{SchedulerError, SchedulerResult};
use crate::grouping::GroupResolver;
use crate::types::{ItemIndex, WorkItem, WorkerId};
use crate::worker::{WorkerHandle, WorkerRegistry};
use crate::workset::{WorkQueue, Workset};

/// Minimum number of items a worker should hold so it always knows its next item.
const MIN_PENDING: usize = 2;

#[derive(Debug)]
pub struct LoadScheduler {
    mode: DistMode,
    resolver: GroupResolver,
    shuffled: bool,
    single_collector: bool,
    max_sched_chunk: Option<usize>,
    slow_item_threshold: Duration,
    rng: StdRng,
    validator: CollectionValidator,
    /// First registered worker in `singlecollect` mode
    collector: Option<WorkerId>,
    registry: WorkerRegistry,
    queue: WorkQueue,
    distributed: bool,
}

impl LoadScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self::with_resolver(config, GroupResolver::new(config.mode.grouping()))
    }

    pub fn with_resolver(config: &SchedulerConfig, resolver: GroupResolver) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            mode: config.mode,
            resolver,
            shuffled: config.mode == DistMode::LoadScopeShuffled,
            single_collector: config.mode == DistMode::SingleCollect,
            max_sched_chunk: config.max_sched_chunk,
            slow_item_threshold: config.slow_item_threshold(),
            rng,
            validator: CollectionValidator::new(config.expected_workers),
            collector: None,
            registry: WorkerRegistry::new(),
            queue: WorkQueue::new(),
            distributed: false,
        }
    }

    /// Number of items not yet handed to any worker.
    pub fn queued_items(&self) -> usize {
        self.queue.item_count()
    }

    /// Items pending on `worker`, in send order.
    pub fn pending_of(&self, worker: &str) -> Option<Vec<ItemIndex>> {
        self.registry
            .get_active(worker)
            .map(|proxy| proxy.pending_items().map(|item| item.index).collect())
    }

    fn max_chunk(&self) -> usize {
        self.max_sched_chunk
            .unwrap_or_else(|| self.validator.authoritative().map_or(0, <[String]>::len))
    }

    fn next_group(&mut self) -> Option<Workset> {
        if self.shuffled {
            self.queue.take_random(&mut self.rng)
        } else {
            self.queue.take_head()
        }
    }

    /// Whole groups worth at least `budget` items, and at least one group.
    fn take_groups(&mut self, budget: usize) -> Vec<WorkItem> {
        let mut batch = Vec::new();
        while batch.is_empty() || batch.len() < budget {
            let Some(mut workset) = self.next_group() else {
                break;
            };
            let mut items = workset.take_all();
            if self.shuffled {
                items.shuffle(&mut self.rng);
            }
            batch.extend(items);
        }
        batch
    }

    fn send_to(&mut self, worker: &str, items: Vec<WorkItem>) {
        match self.registry.get_active_mut(worker) {
            Some(proxy) => proxy.send(items),
            None => {
                for item in items {
                    self.queue.push(item);
                }
            }
        }
    }

    fn build_queue(&mut self) {
        let collection: Vec<String> = self
            .validator
            .authoritative()
            .map(<[String]>::to_vec)
            .unwrap_or_default();
        for (index, id) in collection.into_iter().enumerate() {
            let group = self.resolver.resolve(&id);
            self.queue.push(WorkItem::new(index, id, group));
        }
        info!(
            "Queued {} items in {} groups ({})",
            self.queue.item_count(),
            self.queue.len(),
            self.mode
        );
    }

    fn initial_distribution(&mut self) {
        let workers = self.registry.active_ids();
        if workers.is_empty() {
            warn!("No admitted workers yet, initial distribution deferred");
            return;
        }

        let num_workers = workers.len();
        if self.queue.len() < 2 * num_workers {
            // Too few groups for chunking, deal them out one at a time.
            let mut batches: Vec<Vec<WorkItem>> = vec![Vec::new(); num_workers];
            let mut turn = 0;
            while !self.queue.is_empty() {
                let group = self.take_groups(1);
                batches[turn % num_workers].extend(group);
                turn += 1;
            }
            for (worker, batch) in workers.iter().zip(batches) {
                self.send_to(worker, batch);
            }
        } else {
            let items_per_worker = self.queue.item_count() / num_workers;
            let chunk = (items_per_worker / 4).min(self.max_chunk()).max(MIN_PENDING);
            debug!(
                "Initial chunk of {} items for {} workers",
                chunk, num_workers
            );
            for worker in &workers {
                let batch = self.take_groups(chunk);
                self.send_to(worker, batch);
            }
        }

        for proxy in self.registry.active_mut() {
            if proxy.is_empty() {
                info!("Shutting down unused worker {}", proxy.id());
                proxy.shutdown();
            }
        }
        if self.queue.is_empty() {
            info!("Initial distribution sent all items, shutting down workers");
            for proxy in self.registry.active_mut() {
                proxy.shutdown();
            }
        }
    }

    /// Maybe send more work to `worker`.
    fn reschedule(&mut self, worker: &str, duration: Duration) {
        if !self.distributed {
            return;
        }
        let num_workers = self.registry.active_len();
        let queued = self.queue.item_count();
        let queue_empty = self.queue.is_empty();
        let max_chunk = self.max_chunk();
        let slow_threshold = self.slow_item_threshold;

        let Some(proxy) = self.registry.get_active_mut(worker) else {
            return;
        };
        if proxy.is_shutting_down() {
            return;
        }
        if queue_empty {
            proxy.shutdown();
            return;
        }

        let pending = proxy.pending_count();
        let low = MIN_PENDING.max(queued / num_workers / 4);
        let high = MIN_PENDING.max(queued / num_workers / 2);
        if pending >= low {
            return;
        }
        if duration >= slow_threshold && pending >= MIN_PENDING {
            debug!(
                "Worker {} is running slow items ({:?}), deferring refill",
                worker, duration
            );
            return;
        }

        let budget = (high - pending).min(MIN_PENDING.saturating_sub(pending).max(max_chunk));
        let batch = self.take_groups(budget);
        debug!(
            "Refilling worker {} with {} items, {} left in queue",
            worker,
            batch.len(),
            self.queue.item_count()
        );
        self.send_to(worker, batch);
    }

    fn reschedule_all(&mut self) {
        for worker in self.registry.active_ids() {
            self.reschedule(&worker, Duration::ZERO);
        }
    }
}

impl Scheduler for LoadScheduler {
    fn mode(&self) -> DistMode {
        self.mode
    }

    fn add_worker(&mut self, handle: Box<dyn WorkerHandle>) -> SchedulerResult<()> {
        let id = handle.id().to_string();
        info!("Registering worker: {}", id);
        // singlecollect trusts one collection, every worker is schedulable
        self.registry.register(handle, self.single_collector)?;
        if self.single_collector && self.collector.is_none() && !self.validator.is_complete() {
            info!("Using {} as collection worker", id);
            self.collector = Some(id);
        }
        Ok(())
    }

    fn add_worker_collection(
        &mut self,
        worker: &str,
        items: Vec<String>,
    ) -> SchedulerResult<Vec<CollectionMismatch>> {
        if !self.registry.contains(worker) {
            return Err(SchedulerError::UnknownWorker(worker.to_string()));
        }
        if self.single_collector {
            if self.collector.as_deref() == Some(worker) && !self.validator.is_complete() {
                self.validator.fix(worker, items);
            } else {
                debug!("Ignoring collection from worker {}", worker);
            }
            return Ok(Vec::new());
        }

        let outcome = self.validator.record(worker, items);
        for admitted in &outcome.admitted {
            if self.registry.admit(admitted) {
                debug!("Admitted worker {}", admitted);
            }
        }
        Ok(outcome.mismatches)
    }

    fn mark_item_complete(
        &mut self,
        worker: &str,
        item_index: ItemIndex,
        duration: Duration,
    ) -> SchedulerResult<()> {
        let proxy = self
            .registry
            .get_active_mut(worker)
            .ok_or_else(|| SchedulerError::UnknownWorker(worker.to_string()))?;
        let item = proxy.complete(item_index);
        debug!("Worker {} completed {} in {:?}", worker, item, duration);
        self.reschedule(worker, duration);
        Ok(())
    }

    fn mark_item_pending(&mut self, item_id: &str) -> SchedulerResult<()> {
        let index = self
            .validator
            .authoritative()
            .and_then(|collection| collection.iter().position(|id| id == item_id))
            .ok_or_else(|| SchedulerError::UnknownItem(item_id.to_string()))?;
        assert!(
            !self
                .registry
                .active()
                .any(|proxy| proxy.pending_items().any(|item| item.index == index)),
            "item {} is still pending on a worker",
            item_id
        );
        let group = self.resolver.resolve(item_id);
        info!("Requeueing {} at the front of the queue", item_id);
        self.queue.push_front(WorkItem::new(index, item_id, group));
        self.reschedule_all();
        Ok(())
    }

    fn remove_worker(&mut self, worker: &str) -> SchedulerResult<Option<String>> {
        let (mut proxy, _) = self
            .registry
            .remove(worker)
            .ok_or_else(|| SchedulerError::UnknownWorker(worker.to_string()))?;
        self.validator.forget(worker);
        if self.collector.as_deref() == Some(worker) && !self.validator.is_complete() {
            self.collector = None;
        }

        let mut pending = proxy.release_pending();
        if pending.is_empty() {
            info!("Removed worker {}", worker);
            return Ok(None);
        }
        let crashed = pending.remove(0);
        warn!(
            "Worker {} went down while running {}, requeueing {} items",
            worker,
            crashed,
            pending.len()
        );
        for item in pending {
            self.queue.push(item);
        }
        self.reschedule_all();
        Ok(Some(crashed.id))
    }

    fn is_collection_complete(&self) -> bool {
        self.validator.is_complete()
    }

    fn has_pending_work(&self) -> bool {
        !self.queue.is_empty() || self.registry.active().any(|proxy| !proxy.is_empty())
    }

    fn all_work_finished(&self) -> bool {
        self.is_collection_complete()
            && self.queue.is_empty()
            && self
                .registry
                .active()
                .all(|proxy| proxy.pending_count() < MIN_PENDING)
    }

    fn schedule(&mut self) {
        assert!(
            self.is_collection_complete(),
            "schedule() called before the collection was complete"
        );
        if self.distributed {
            self.reschedule_all();
            return;
        }
        self.distributed = true;
        self.build_queue();
        self.initial_distribution();
    }

    fn shutdown_all(&mut self) {
        self.registry.shutdown_all();
    }

    fn workers(&self) -> Vec<WorkerId> {
        self.registry.ids()
    }

    fn collection(&self) -> Option<&[String]> {
        self.validator.authoritative()
    }
}
