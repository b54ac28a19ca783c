//! Phase scheduler for custom groups
//!
//! Items carry a marker after their last `@` (`test_io@low`). Every marker
//! forms one phase, and phases run one after the other in the order their
//! first item was collected. A phase is dealt out round robin over a
//! limited number of workers: the `group_workers` entry of the marker, else a
//! trailing `_<n>` in the marker (`heavy_2`), else every worker. Items without
//! a marker form the `default` phase, which uses every worker.
//!
//! The next phase starts once every worker is down to the last item of the
//! current one, since workers hold their final item until more work or a
//! shutdown arrives.

use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::Scheduler;
use crate::collection::{CollectionMismatch, CollectionValidator};
use crate::config::{DistMode, SchedulerConfig};
use crate::error::{SchedulerError, SchedulerResult};
use crate::grouping::GroupResolver;
use crate::types::{ItemIndex, WorkItem, WorkerId};
use crate::worker::{WorkerHandle, WorkerRegistry};
use crate::workset::WorkQueue;

/// Worker limit requested by `marker`, if any.
fn requested_workers(limits: &BTreeMap<String, usize>, marker: &str) -> Option<usize> {
    limits.get(marker).copied().or_else(|| {
        marker
            .rsplit_once('_')
            .and_then(|(_, count)| count.parse().ok())
    })
}

#[derive(Debug)]
pub struct CustomGroupScheduler {
    resolver: GroupResolver,
    group_workers: BTreeMap<String, usize>,
    validator: CollectionValidator,
    registry: WorkerRegistry,
    queue: WorkQueue,
    /// Marker of the phase most recently dealt out
    current_phase: Option<String>,
    distributed: bool,
}

impl CustomGroupScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self::with_resolver(config, GroupResolver::new(config.mode.grouping()))
    }

    pub fn with_resolver(config: &SchedulerConfig, resolver: GroupResolver) -> Self {
        Self {
            resolver,
            group_workers: config.group_workers.clone(),
            validator: CollectionValidator::new(config.expected_workers),
            registry: WorkerRegistry::new(),
            queue: WorkQueue::new(),
            current_phase: None,
            distributed: false,
        }
    }

    pub fn current_phase(&self) -> Option<&str> {
        self.current_phase.as_deref()
    }

    /// Phases not started yet, in run order.
    pub fn queued_phases(&self) -> Vec<String> {
        let mut queue = self.queue.clone();
        std::iter::from_fn(|| queue.take_head())
            .map(|workset| workset.key().to_string())
            .collect()
    }

    pub fn pending_of(&self, worker: &str) -> Option<Vec<ItemIndex>> {
        self.registry
            .get_active(worker)
            .map(|proxy| proxy.pending_items().map(|item| item.index).collect())
    }

    fn build_queue(&mut self) {
        let collection: Vec<String> = self
            .validator
            .authoritative()
            .map(<[String]>::to_vec)
            .unwrap_or_default();
        for (index, id) in collection.into_iter().enumerate() {
            let phase = self.resolver.resolve(&id);
            self.queue.push(WorkItem::new(index, id, phase));
        }
        info!(
            "Queued {} items in {} phases",
            self.queue.item_count(),
            self.queue.len()
        );
    }

    /// Start phases while every worker is down to its last item, then shut
    /// down idle workers once no phase is left.
    fn advance(&mut self) {
        if !self.distributed {
            return;
        }
        while !self.queue.is_empty() {
            if self.registry.active().any(|proxy| proxy.pending_count() > 1) {
                return;
            }
            // Workers still holding an item come first, so it gets run.
            let mut available: Vec<(WorkerId, bool)> = self
                .registry
                .active()
                .filter(|proxy| !proxy.is_shutting_down())
                .map(|proxy| (proxy.id().to_string(), proxy.is_empty()))
                .collect();
            available.sort_by_key(|(_, empty)| *empty);
            let available: Vec<WorkerId> = available.into_iter().map(|(id, _)| id).collect();
            if available.is_empty() {
                debug!("No workers available for the next phase, waiting for replacements");
                return;
            }
            self.start_phase(&available);
        }

        for proxy in self.registry.active_mut() {
            if !proxy.is_shutting_down() && proxy.pending_count() < 2 {
                debug!("No phase left, shutting down worker {}", proxy.id());
                proxy.shutdown();
            }
        }
    }

    fn start_phase(&mut self, available: &[WorkerId]) {
        let Some(mut workset) = self.queue.take_head() else {
            return;
        };
        let marker = workset.key().to_string();
        let num_workers = match requested_workers(&self.group_workers, &marker) {
            Some(requested) => {
                let granted = requested.clamp(1, available.len());
                if granted != requested {
                    warn!(
                        "Phase {} asked for {} workers, running on {}",
                        marker, requested, granted
                    );
                }
                granted
            }
            None => available.len(),
        };

        let mut batches: Vec<Vec<WorkItem>> = vec![Vec::new(); num_workers];
        for (turn, item) in workset.take_all().into_iter().enumerate() {
            batches[turn % num_workers].push(item);
        }
        let sizes: Vec<String> = available
            .iter()
            .zip(&batches)
            .map(|(worker, batch)| format!("{} ({})", worker, batch.len()))
            .collect();
        info!("Started phase {}: {}", marker, sizes.join(" "));

        for (worker, batch) in available.iter().zip(batches) {
            if let Some(proxy) = self.registry.get_active_mut(worker) {
                proxy.send(batch);
            }
        }
        self.current_phase = Some(marker);
    }
}

impl Scheduler for CustomGroupScheduler {
    fn mode(&self) -> DistMode {
        DistMode::CustomGroup
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
        self.advance();
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
        let phase = self.resolver.resolve(item_id);
        info!("Requeueing {} at the front of phase {}", item_id, phase);
        self.queue.push_front(WorkItem::new(index, item_id, phase));
        self.advance();
        Ok(())
    }

    fn remove_worker(&mut self, worker: &str) -> SchedulerResult<Option<String>> {
        let (mut proxy, _) = self
            .registry
            .remove(worker)
            .ok_or_else(|| SchedulerError::UnknownWorker(worker.to_string()))?;
        self.validator.forget(worker);

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
        // Ahead of later phases, in their original order
        for item in pending.into_iter().rev() {
            self.queue.push_front(item);
        }
        self.advance();
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
            && self.registry.active().all(|proxy| proxy.pending_count() < 2)
    }

    fn schedule(&mut self) {
        assert!(
            self.is_collection_complete(),
            "schedule() called before the collection was complete"
        );
        if !self.distributed {
            self.distributed = true;
            self.build_queue();
        }
        self.advance();
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingWorker, WorkerRecord};

    fn marked(marker: &str, count: usize) -> Vec<String> {
        (0..count)
            .map(|i| format!("t_{}.py::test_{}@{}", marker, i, marker))
            .collect()
    }

    fn started(
        config: SchedulerConfig,
        collection: &[String],
        workers: &[&str],
    ) -> (CustomGroupScheduler, Vec<WorkerRecord>) {
        let mut sched = CustomGroupScheduler::new(&config);
        let mut records = Vec::new();
        for id in workers {
            let (handle, record) = RecordingWorker::boxed(*id);
            sched.add_worker(handle).unwrap();
            records.push(record);
        }
        for id in workers {
            sched.add_worker_collection(id, collection.to_vec()).unwrap();
        }
        sched.schedule();
        (sched, records)
    }

    fn limits(workers: usize) -> SchedulerConfig {
        SchedulerConfig::new(DistMode::CustomGroup, workers)
            .with_group_workers("low", 4)
            .with_group_workers("medium", 2)
            .with_group_workers("high", 1)
    }

    #[test]
    fn test_requested_workers() {
        let limits = limits(4).group_workers;
        assert_eq!(requested_workers(&limits, "medium"), Some(2));
        assert_eq!(requested_workers(&limits, "heavy_3"), Some(3));
        assert_eq!(requested_workers(&limits, "default"), None);
        assert_eq!(requested_workers(&limits, "odd_name"), None);
    }

    #[test]
    fn test_first_phase_uses_its_limit() {
        let mut collection = marked("medium", 4);
        collection.extend(marked("low", 8));
        let (sched, records) = started(limits(4), &collection, &["gw0", "gw1", "gw2", "gw3"]);

        assert_eq!(sched.current_phase(), Some("medium"));
        assert_eq!(records[0].sent(), vec![0, 2]);
        assert_eq!(records[1].sent(), vec![1, 3]);
        assert!(records[2].sent().is_empty());
        assert!(records[3].sent().is_empty());
        assert_eq!(sched.queued_phases(), vec!["low".to_string()]);
    }

    #[test]
    fn test_next_phase_waits_for_last_items() {
        let mut collection = marked("low", 8);
        collection.extend(marked("high", 2));
        let (mut sched, records) = started(limits(4), &collection, &["gw0", "gw1", "gw2", "gw3"]);
        assert_eq!(records[0].sent(), vec![0, 4]);

        for (i, (id, record)) in ["gw0", "gw1", "gw2"].iter().zip(&records).enumerate() {
            sched
                .mark_item_complete(id, record.sent()[0], Duration::ZERO)
                .unwrap();
            assert_eq!(sched.current_phase(), Some("low"), "after {} completions", i + 1);
        }

        // gw3 is the last one running two items of the phase
        sched.mark_item_complete("gw3", 3, Duration::ZERO).unwrap();
        assert_eq!(sched.current_phase(), Some("high"));
        assert_eq!(records[0].batches()[1], vec![8, 9]);
        assert!(!records[0].is_shut_down());
        assert!(records[1..].iter().all(WorkerRecord::is_shut_down));
        assert!(!sched.all_work_finished());
    }

    #[test]
    fn test_default_phase_uses_every_worker() {
        let collection: Vec<String> = (0..6).map(|i| format!("a.py::test_{}", i)).collect();
        let (sched, records) = started(
            SchedulerConfig::new(DistMode::CustomGroup, 3),
            &collection,
            &["gw0", "gw1", "gw2"],
        );
        assert_eq!(sched.current_phase(), Some("default"));
        let sizes: Vec<usize> = records.iter().map(|p| p.sent().len()).collect();
        assert_eq!(sizes, vec![2, 2, 2]);
    }

    #[test]
    fn test_limit_clamped_to_workers() {
        let collection = marked("wide_8", 4);
        let (_sched, records) = started(
            SchedulerConfig::new(DistMode::CustomGroup, 2),
            &collection,
            &["gw0", "gw1"],
        );
        assert_eq!(records[0].sent(), vec![0, 2]);
        assert_eq!(records[1].sent(), vec![1, 3]);
    }

    #[test]
    fn test_crash_requeues_ahead_of_later_phases() {
        let mut collection = marked("medium", 6);
        collection.extend(marked("high", 2));
        let (mut sched, records) = started(limits(2), &collection, &["gw0", "gw1"]);
        assert_eq!(records[0].sent(), vec![0, 2, 4]);

        let crashed = sched.remove_worker("gw0").unwrap();
        assert_eq!(crashed.as_deref(), Some(collection[0].as_str()));
        assert_eq!(
            sched.queued_phases(),
            vec!["medium".to_string(), "high".to_string()]
        );

        // gw1 runs down its share, then picks up the requeued items
        sched.mark_item_complete("gw1", 1, Duration::ZERO).unwrap();
        sched.mark_item_complete("gw1", 3, Duration::ZERO).unwrap();
        assert_eq!(records[1].batches()[1], vec![2, 4]);
        assert_eq!(sched.current_phase(), Some("medium"));
    }

    #[test]
    fn test_requeue_after_shutdown_waits_for_replacement() {
        let collection = marked("low", 4);
        let (mut sched, records) = started(
            SchedulerConfig::new(DistMode::CustomGroup, 1),
            &collection,
            &["gw0"],
        );
        for index in 0..3 {
            sched.mark_item_complete("gw0", index, Duration::ZERO).unwrap();
        }
        assert!(records[0].is_shut_down());

        sched.mark_item_pending(&collection[1]).unwrap();
        assert!(sched.has_pending_work());
        assert_eq!(records[0].batches().len(), 1);
        assert!(matches!(
            sched.mark_item_pending("nope.py::test"),
            Err(SchedulerError::UnknownItem(_))
        ));

        let (handle, replacement) = RecordingWorker::boxed("gw1");
        sched.add_worker(handle).unwrap();
        sched.add_worker_collection("gw1", collection.clone()).unwrap();
        sched.schedule();
        assert_eq!(replacement.sent(), vec![1]);
        assert!(replacement.is_shut_down());
    }

    #[test]
    fn test_mark_item_pending_jumps_the_queue() {
        let mut collection = marked("low", 4);
        collection.extend(marked("high", 2));
        let (mut sched, records) = started(
            SchedulerConfig::new(DistMode::CustomGroup, 2),
            &collection,
            &["gw0", "gw1"],
        );
        sched.mark_item_complete("gw0", 0, Duration::ZERO).unwrap();

        // Flaky item asked to run again
        sched.mark_item_pending(&collection[0]).unwrap();
        assert_eq!(sched.queued_phases(), vec!["low".to_string(), "high".to_string()]);

        sched.mark_item_complete("gw1", 1, Duration::ZERO).unwrap();
        assert_eq!(records[0].batches()[1], vec![0]);
        assert_eq!(sched.current_phase(), Some("low"));
    }

    #[test]
    #[should_panic(expected = "still pending")]
    fn test_mark_item_pending_rejects_in_flight_item() {
        let collection = marked("low", 4);
        let (mut sched, _records) = started(
            SchedulerConfig::new(DistMode::CustomGroup, 1),
            &collection,
            &["gw0"],
        );
        let _ = sched.mark_item_pending(&collection[2]);
    }
}
