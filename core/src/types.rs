//! Core types shared by the schedulers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for workers
pub type WorkerId = String;

/// Position of an item in the authoritative collection
pub type ItemIndex = usize;

/// Key grouping items that must be scheduled together
pub type GroupKey = String;

/// A single schedulable unit of work.
///
/// The group key is computed once, by the grouping policy of the scheduler
/// that owns the item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItem {
    pub index: ItemIndex,
    pub id: String,
    pub group: GroupKey,
}

impl WorkItem {
    pub fn new(index: ItemIndex, id: impl Into<String>, group: impl Into<GroupKey>) -> Self {
        Self {
            index,
            id: id.into(),
            group: group.into(),
        }
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} [{}]", self.index, self.id, self.group)
    }
}
