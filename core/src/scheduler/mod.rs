//! Work scheduler module
//!
//! This module provides the scheduling policies that decide, while workers
//! are running, which items each worker executes next. Every policy
//! implements the [`Scheduler`] contract and is driven one event at a time.

pub mod customgroup;
pub mod isoscope;
pub mod load;

pub use customgroup::*;
pub use isoscope::*;
pub use load::*;

use std::fmt::Debug;
use std::time::Duration;
use tracing::{info, warn};

use crate::collection::CollectionMismatch;
use crate::config::{DistMode, SchedulerConfig};
use crate::error::SchedulerResult;
use crate::grouping::{GroupOverride, GroupResolver};
use crate::types::{ItemIndex, WorkerId};
use crate::worker::WorkerHandle;

/// Contract shared by all scheduling policies.
///
/// Schedulers are synchronous and single threaded. They never block; all
/// concurrency lives in the workers and in the event loop feeding them.
pub trait Scheduler: Send + Debug {
    /// Policy implemented by this scheduler.
    fn mode(&self) -> DistMode;

    /// Register a worker with an empty pending set.
    fn add_worker(&mut self, handle: Box<dyn WorkerHandle>) -> SchedulerResult<()>;

    /// Record the ordered item ids a worker collected.
    ///
    /// Returns the mismatches detected by this call. Mismatching workers stay
    /// registered but never receive work.
    fn add_worker_collection(
        &mut self,
        worker: &str,
        items: Vec<String>,
    ) -> SchedulerResult<Vec<CollectionMismatch>>;

    /// Record completion of the head pending item of `worker`.
    ///
    /// # Panics
    ///
    /// If `item_index` is not the worker's head pending item.
    fn mark_item_complete(
        &mut self,
        worker: &str,
        item_index: ItemIndex,
        duration: Duration,
    ) -> SchedulerResult<()>;

    /// Put a finished or crashed item back at the front of the queue so it
    /// runs again before anything else.
    ///
    /// Workers already told to shut down do not pick it up.
    ///
    /// # Panics
    ///
    /// If the item is still pending on a worker.
    fn mark_item_pending(&mut self, item_id: &str) -> SchedulerResult<()>;

    /// Unregister a worker. Its pending items go back to the queue and the
    /// head one is returned as the presumed crash item. Only the scope
    /// isolation policy runs the crash item again.
    fn remove_worker(&mut self, worker: &str) -> SchedulerResult<Option<String>>;

    /// Whether the authoritative collection has been fixed.
    fn is_collection_complete(&self) -> bool;

    /// Whether items are queued or still pending on a worker.
    fn has_pending_work(&self) -> bool;

    /// Whether every item has been handed out and will complete without
    /// further scheduling decisions.
    fn all_work_finished(&self) -> bool;

    /// Distribute work. The first call performs the initial distribution,
    /// later calls reschedule every worker.
    ///
    /// # Panics
    ///
    /// If the collection is not complete.
    fn schedule(&mut self);

    /// Send the shutdown signal to every registered worker.
    fn shutdown_all(&mut self);

    /// Registered workers, admitted ones first.
    fn workers(&self) -> Vec<WorkerId>;

    /// The authoritative collection, once fixed.
    fn collection(&self) -> Option<&[String]>;
}

/// Builds the scheduler matching a [`SchedulerConfig`].
#[derive(Debug, Clone)]
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    resolver: GroupResolver,
}

impl SchedulerBuilder {
    pub fn new(config: SchedulerConfig) -> Self {
        let resolver = GroupResolver::new(config.mode.grouping());
        Self { config, resolver }
    }

    /// Group items with `custom` first, falling back to the mode's grouping.
    pub fn group_override(mut self, custom: GroupOverride) -> Self {
        self.resolver = self.resolver.with_override(custom);
        self
    }

    pub fn build(self) -> SchedulerResult<Box<dyn Scheduler>> {
        self.config.validate()?;
        let scheduler: Box<dyn Scheduler> = match self.config.mode {
            DistMode::IsoScope => {
                if self.resolver.has_override() {
                    warn!("Group override ignored: isoscope always groups by scope");
                }
                Box::new(IsoScopeScheduler::new(&self.config))
            }
            DistMode::CustomGroup => Box::new(CustomGroupScheduler::with_resolver(
                &self.config,
                self.resolver,
            )),
            _ => Box::new(LoadScheduler::with_resolver(&self.config, self.resolver)),
        };
        info!("Built {} scheduler", self.config.mode);
        Ok(scheduler)
    }
}
