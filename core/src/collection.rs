//! Collection validation
//!
//! Every worker discovers the items on its own and reports the ordered list.
//! Once enough workers have reported, the first reporter's list becomes the
//! authoritative collection and every other list is compared against it.
//! Workers whose lists differ are not admitted to scheduling; the mismatch
//! is handed back to the caller as a report, never as a fatal error.

use indexmap::IndexMap;
use similar::TextDiff;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::types::WorkerId;

/// Two workers disagree on the collected items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionMismatch {
    pub reference_worker: WorkerId,
    pub worker: WorkerId,
    /// Unified diff from the reference collection to the worker's.
    pub diff: String,
}

impl fmt::Display for CollectionMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Different tests were collected between {} and {}. The difference is:\n{}",
            self.reference_worker, self.worker, self.diff
        )
    }
}

/// Unified diff between two collections, or `None` when they are equal.
pub fn collection_diff(
    reference: &[String],
    other: &[String],
    reference_id: &str,
    other_id: &str,
) -> Option<String> {
    if reference == other {
        return None;
    }
    let old = join_lines(reference);
    let new = join_lines(other);
    let diff = TextDiff::from_lines(&old, &new)
        .unified_diff()
        .header(reference_id, other_id)
        .to_string();
    Some(diff)
}

fn join_lines(items: &[String]) -> String {
    let mut text = String::new();
    for item in items {
        text.push_str(item);
        text.push('\n');
    }
    text
}

/// Result of recording one worker's collection.
#[derive(Debug, Default)]
pub struct ValidationOutcome {
    /// Workers whose collection is now known to match the authoritative one.
    pub admitted: Vec<WorkerId>,
    pub mismatches: Vec<CollectionMismatch>,
}

#[derive(Debug, Clone)]
struct Authoritative {
    worker: WorkerId,
    items: Arc<[String]>,
}

/// Fixes the authoritative collection and validates workers against it.
#[derive(Debug)]
pub struct CollectionValidator {
    expected_workers: usize,
    reported: IndexMap<WorkerId, Vec<String>>,
    authoritative: Option<Authoritative>,
}

impl CollectionValidator {
    pub fn new(expected_workers: usize) -> Self {
        Self {
            expected_workers,
            reported: IndexMap::new(),
            authoritative: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.authoritative.is_some()
    }

    pub fn authoritative(&self) -> Option<&[String]> {
        self.authoritative.as_ref().map(|a| &*a.items)
    }

    pub fn reference_worker(&self) -> Option<&str> {
        self.authoritative.as_ref().map(|a| a.worker.as_str())
    }

    /// Adopt `items` as authoritative without waiting for other reporters.
    pub fn fix(&mut self, worker: &str, items: Vec<String>) {
        assert!(
            self.authoritative.is_none(),
            "authoritative collection already fixed"
        );
        info!(
            "Using collection of {} from worker {}",
            items.len(),
            worker
        );
        self.authoritative = Some(Authoritative {
            worker: worker.to_string(),
            items: items.into(),
        });
        self.reported.clear();
    }

    /// Record a worker's collection.
    pub fn record(&mut self, worker: &str, items: Vec<String>) -> ValidationOutcome {
        let mut outcome = ValidationOutcome::default();

        if let Some(auth) = &self.authoritative {
            match collection_diff(&auth.items, &items, &auth.worker, worker) {
                None => outcome.admitted.push(worker.to_string()),
                Some(diff) => {
                    let mismatch = CollectionMismatch {
                        reference_worker: auth.worker.clone(),
                        worker: worker.to_string(),
                        diff,
                    };
                    warn!("{}", mismatch);
                    outcome.mismatches.push(mismatch);
                }
            }
            return outcome;
        }

        self.reported.insert(worker.to_string(), items);
        if self.reported.len() < self.expected_workers {
            return outcome;
        }

        let mut reported = std::mem::take(&mut self.reported).into_iter();
        let Some((reference_worker, reference)) = reported.next() else {
            return outcome;
        };
        let reference: Arc<[String]> = reference.into();
        outcome.admitted.push(reference_worker.clone());

        for (other_worker, other) in reported {
            match collection_diff(&reference, &other, &reference_worker, &other_worker) {
                None => outcome.admitted.push(other_worker),
                Some(diff) => {
                    let mismatch = CollectionMismatch {
                        reference_worker: reference_worker.clone(),
                        worker: other_worker,
                        diff,
                    };
                    warn!("{}", mismatch);
                    outcome.mismatches.push(mismatch);
                }
            }
        }

        info!(
            "Collection complete: {} items from worker {}, {} workers admitted",
            reference.len(),
            reference_worker,
            outcome.admitted.len()
        );
        self.authoritative = Some(Authoritative {
            worker: reference_worker,
            items: reference,
        });
        outcome
    }

    /// Drop a departed worker's report if the collection is not fixed yet.
    pub fn forget(&mut self, worker: &str) {
        self.reported.shift_remove(worker);
    }
}
