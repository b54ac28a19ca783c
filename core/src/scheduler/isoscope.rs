//! Scope-isolation scheduler
//!
//! Distributes one scope at a time across all workers, so that the setup and
//! teardown phases of a scope's shared fixtures never interleave with those
//! of another scope.
//!
//! The scheduler is a four-state machine re-evaluated to a fixed point every
//! time new information arrives:
//!
//! ```text
//!  WaitActivate --> ActivateScope --> WaitFence --> Fence
//!       ^                                  |          |
//!       +----------------------------------+----------+
//! ```
//!
//! Every worker running a scope receives either one item (only when the
//! scope has a single item) or at least two, so it always knows the next item
//! to run. When a scope is down to its last item per worker, those workers
//! are *fenced*: each gets one item borrowed from a later scope, which keeps
//! it busy until the tail item of the current scope has completed. Workers
//! that cannot be fenced are shut down.
//!
//! Workers are expected to hold their final pending item until more work or a
//! shutdown arrives.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::Scheduler;
use crate::collection::{CollectionMismatch, CollectionValidator};
use crate::config::{DistMode, SchedulerConfig};
use crate::error::{SchedulerError, SchedulerResult};
use crate::grouping::scope_of;
use crate::types::{GroupKey, ItemIndex, WorkItem, WorkerId};
use crate::worker::{WorkerHandle, WorkerRegistry};
use crate::workset::{WorkQueue, Workset};

/// Scheduling state of the scope-isolation machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsoState {
    /// Waiting until the next scope can be distributed.
    WaitActivate,
    /// Distribute the head scope.
    ActivateScope,
    /// Waiting until every worker is down to its last item.
    WaitFence,
    /// Fence the workers holding the last items of the active scope.
    Fence,
}

impl IsoState {
    pub const COUNT: usize = 4;
}

/// Number of workers a scope of `num_items` may occupy while keeping at least
/// two of its items on each, unless it has a single item.
pub fn max_workers_for(num_items: usize) -> usize {
    match num_items {
        0 => 0,
        1 => 1,
        n => n / 2,
    }
}

/// How many items may still be withdrawn from `workset` for fencing.
///
/// Every item missing from a workset is assumed to have been withdrawn as a
/// fence item.
fn fence_capacity(workset: &Workset) -> usize {
    let withdrawn = workset.high_water() - workset.len();
    let max_workers = max_workers_for(workset.high_water());
    assert!(
        withdrawn <= max_workers,
        "workset {} lent {} fence items, more than its {} workers",
        workset.key(),
        withdrawn,
        max_workers
    );
    max_workers - withdrawn
}

#[derive(Debug)]
pub struct IsoScopeScheduler {
    state: IsoState,
    active_scope: Option<GroupKey>,
    validator: CollectionValidator,
    registry: WorkerRegistry,
    queue: WorkQueue,
    rng: StdRng,
}

impl IsoScopeScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            state: IsoState::WaitActivate,
            active_scope: None,
            validator: CollectionValidator::new(config.expected_workers),
            registry: WorkerRegistry::new(),
            queue: WorkQueue::new(),
            rng,
        }
    }

    pub fn state(&self) -> IsoState {
        self.state
    }

    /// Scope most recently distributed.
    pub fn active_scope(&self) -> Option<&str> {
        self.active_scope.as_deref()
    }

    pub fn queued_items(&self) -> usize {
        self.queue.item_count()
    }

    /// Items pending on an admitted worker, in send order.
    pub fn pending_of(&self, worker: &str) -> Option<Vec<ItemIndex>> {
        self.registry
            .get_active(worker)
            .map(|proxy| proxy.pending_items().map(|item| item.index).collect())
    }

    /// Shuffle the authoritative collection and queue it by scope.
    fn enqueue_collection(&mut self) {
        let mut items: Vec<WorkItem> = self
            .validator
            .authoritative()
            .unwrap_or_default()
            .iter()
            .enumerate()
            .map(|(index, id)| WorkItem::new(index, id.as_str(), scope_of(id)))
            .collect();
        // Break up ordering relationships such as runs of slow neighbours.
        items.shuffle(&mut self.rng);
        for item in items {
            self.queue.push(item);
        }
        info!(
            "Queued {} items in {} scopes",
            self.queue.item_count(),
            self.queue.len()
        );
    }

    fn transition(&mut self, next: IsoState) {
        info!("Transitioned from {:?} to {:?}", self.state, next);
        self.state = next;
    }

    /// Run the state machine until it stops making progress.
    fn reschedule(&mut self) {
        let bound = 2 * IsoState::COUNT;
        let mut traversed = Vec::with_capacity(bound);
        loop {
            assert!(
                traversed.len() < bound,
                "too many state transitions: {:?}",
                traversed
            );
            traversed.push(self.state);
            let before = self.state;
            match self.state {
                IsoState::WaitActivate => self.handle_wait_activate(),
                IsoState::ActivateScope => self.handle_activate_scope(),
                IsoState::WaitFence => self.handle_wait_fence(),
                IsoState::Fence => self.handle_fence(),
            }
            if self.state == before {
                break;
            }
        }
    }

    fn handle_wait_activate(&mut self) {
        let Some(next_scope) = self.queue.head().map(|ws| ws.key().to_string()) else {
            return;
        };
        for proxy in self.registry.active() {
            if proxy.pending_count() > 1 {
                return;
            }
            if proxy.is_shutting_down() && !proxy.is_empty() {
                return;
            }
        }
        if self.available_for(&next_scope).is_empty() {
            debug!(
                "No workers available for scope {}, waiting for replacements",
                next_scope
            );
            return;
        }
        self.transition(IsoState::ActivateScope);
    }

    fn handle_activate_scope(&mut self) {
        let Some(workset) = self.queue.take_head() else {
            // Guarded by WaitActivate.
            self.transition(IsoState::WaitActivate);
            return;
        };
        let workers = self.available_for(workset.key());
        assert!(
            !workers.is_empty(),
            "no workers available for scope {}",
            workset.key()
        );
        let scope = workset.key().to_string();
        self.distribute(workset, workers);
        info!("Activated scope {}", scope);
        self.active_scope = Some(scope);
        self.transition(IsoState::WaitFence);
    }

    fn handle_wait_fence(&mut self) {
        if self.registry.active().any(|proxy| proxy.pending_count() > 1) {
            return;
        }
        let Some(scope) = self.active_scope.clone() else {
            self.transition(IsoState::WaitActivate);
            return;
        };
        if self.ready_for_fencing(&scope).is_empty() {
            warn!(
                "Nothing to fence for scope {}, its workers went down",
                scope
            );
            self.transition(IsoState::WaitActivate);
        } else {
            self.transition(IsoState::Fence);
        }
    }

    fn handle_fence(&mut self) {
        let Some(scope) = self.active_scope.clone() else {
            self.transition(IsoState::WaitActivate);
            return;
        };
        let to_fence = self.ready_for_fencing(&scope);
        assert!(!to_fence.is_empty(), "no workers to fence for scope {}", scope);

        for worker in to_fence {
            let fence_item = self.withdraw_fence_item();
            let Some(proxy) = self.registry.get_active_mut(&worker) else {
                continue;
            };
            match fence_item {
                Some(item) => {
                    debug!("Fenced worker {} with {}", worker, item);
                    proxy.send(vec![item]);
                }
                None => {
                    debug!("No fence item left, shutting down worker {}", worker);
                    proxy.shutdown();
                }
            }
        }
        self.transition(IsoState::WaitActivate);
    }

    /// Empty workers not shutting down, and workers whose items belong to `scope`.
    /// Fence holders come first.
    fn available_for(&self, scope: &str) -> Vec<WorkerId> {
        let mut available: Vec<(WorkerId, bool)> = self
            .registry
            .active()
            .filter(|proxy| {
                !proxy.is_shutting_down()
                    && proxy.tail().is_none_or(|item| item.group == scope)
            })
            .map(|proxy| (proxy.id().to_string(), proxy.is_empty()))
            .collect();
        available.sort_by_key(|(_, empty)| *empty);
        available.into_iter().map(|(id, _)| id).collect()
    }

    fn ready_for_fencing(&self, scope: &str) -> Vec<WorkerId> {
        self.registry
            .active()
            .filter(|proxy| {
                !proxy.is_shutting_down()
                    && proxy.pending_count() == 1
                    && proxy.head().is_some_and(|item| item.group == scope)
            })
            .map(|proxy| proxy.id().to_string())
            .collect()
    }

    /// One item from the earliest queued workset with fencing capacity left.
    fn withdraw_fence_item(&mut self) -> Option<WorkItem> {
        self.queue
            .iter_mut()
            .find(|workset| fence_capacity(workset) > 0)
            .and_then(|workset| workset.take_front(1).pop())
    }

    /// Split `workset` over `workers` (fence holders first) so that the
    /// whole scope is handed out.
    fn distribute(&mut self, mut workset: Workset, workers: Vec<WorkerId>) {
        let high_water = workset.high_water();
        let fence_holders = workers
            .iter()
            .filter(|id| self.registry.get_active(id).is_some_and(|p| !p.is_empty()))
            .count();
        assert_eq!(
            workset.len() + fence_holders,
            high_water,
            "scope {} lost track of its fence items",
            workset.key()
        );

        let num_workers = max_workers_for(high_water).min(workers.len());
        assert!(
            num_workers >= fence_holders && num_workers > 0,
            "cannot place scope {} (high water {}) on {} of {} workers",
            workset.key(),
            high_water,
            num_workers,
            workers.len()
        );
        debug!(
            "Distributing scope {} ({} items) to {} workers",
            workset.key(),
            high_water,
            num_workers
        );

        let mut remaining = high_water;
        for (worker, workers_left) in workers.iter().zip((1..=num_workers).rev()) {
            let Some(proxy) = self.registry.get_active_mut(worker) else {
                continue;
            };
            let held = proxy.pending_count();
            assert!(held <= 1, "worker {} holds {} items", worker, held);

            let target = remaining.div_ceil(workers_left);
            remaining -= target;
            let to_add = target - held;
            if to_add > 0 {
                proxy.send(workset.take_front(to_add));
            } else {
                // Only a single-item scope can be fully lent out as a fence.
                assert_eq!(high_water, 1, "nothing to add for worker {}", worker);
            }
        }
        assert!(
            workset.is_empty(),
            "scope {} not fully distributed",
            workset.key()
        );
    }
}

impl Scheduler for IsoScopeScheduler {
    fn mode(&self) -> DistMode {
        DistMode::IsoScope
    }

    fn add_worker(&mut self, handle: Box<dyn WorkerHandle>) -> SchedulerResult<()> {
        info!("Registering worker: {}", handle.id());
        self.registry.register(handle, false)
    }

    fn add_worker_collection(
        &mut self,
        worker: &str,
        items: Vec<String>,
    ) -> SchedulerResult<Vec<CollectionMismatch>> {
        if !self.registry.contains(worker) {
            return Err(SchedulerError::UnknownWorker(worker.to_string()));
        }
        debug!("Collection of {} items from worker {}", items.len(), worker);
        let was_complete = self.validator.is_complete();
        let outcome = self.validator.record(worker, items);
        for admitted in &outcome.admitted {
            self.registry.admit(admitted);
        }
        if !was_complete && self.validator.is_complete() {
            self.enqueue_collection();
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
        self.reschedule();
        Ok(())
    }

    fn mark_item_pending(&mut self, _item_id: &str) -> SchedulerResult<()> {
        // A requeued item could land in a scope that already ran.
        Err(SchedulerError::Unsupported {
            mode: DistMode::IsoScope,
            operation: "mark_item_pending",
        })
    }

    fn remove_worker(&mut self, worker: &str) -> SchedulerResult<Option<String>> {
        info!("Removing worker {}", worker);
        let (mut proxy, admitted) = self
            .registry
            .remove(worker)
            .ok_or_else(|| SchedulerError::UnknownWorker(worker.to_string()))?;
        if !admitted {
            self.validator.forget(worker);
            return Ok(None);
        }

        // Every released item goes back by scope, the presumed crash item
        // included. Fence items return to the workset they were lent from.
        let pending = proxy.release_pending();
        let crashed = pending.first().map(|item| item.id.clone());
        if let Some(head) = pending.first() {
            error!(
                "Worker {} shut down ungracefully, possibly while running {}. Setup and \
                 teardown of its scope's fixtures may now be unbalanced, which can leave the \
                 system under test in an unexpected state for all subsequent tests",
                worker, head
            );
        }
        for item in pending {
            self.queue.push(item);
        }

        if self.validator.is_complete() {
            self.reschedule();
        }
        Ok(crashed)
    }

    fn is_collection_complete(&self) -> bool {
        self.validator.is_complete()
    }

    fn has_pending_work(&self) -> bool {
        !self.queue.is_empty() || self.registry.active().any(|proxy| !proxy.is_empty())
    }

    fn all_work_finished(&self) -> bool {
        self.is_collection_complete() && !self.has_pending_work()
    }

    fn schedule(&mut self) {
        assert!(
            self.is_collection_complete(),
            "schedule() called before the collection was complete"
        );
        self.reschedule();
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
