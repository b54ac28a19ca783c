//! Worksets and the work queue.
//!
//! A [`Workset`] holds the not-yet-dispatched items of one group key together
//! with the largest size it ever reached. The [`WorkQueue`] keeps worksets in
//! first-seen order.

use indexmap::IndexMap;
use rand::Rng;

use crate::types::{GroupKey, ItemIndex, WorkItem};

#[derive(Debug, Clone)]
pub struct Workset {
    key: GroupKey,
    items: IndexMap<ItemIndex, WorkItem>,
    high_water: usize,
}

impl Workset {
    pub fn new(key: impl Into<GroupKey>) -> Self {
        Self {
            key: key.into(),
            items: IndexMap::new(),
            high_water: 0,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Largest number of items this workset ever held.
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn push(&mut self, item: WorkItem) {
        assert_eq!(item.group, self.key, "item {} pushed to wrong workset", item);
        let index = item.index;
        let previous = self.items.insert(index, item);
        assert!(previous.is_none(), "item #{} already queued", index);
        self.high_water = self.high_water.max(self.items.len());
    }

    /// Put `item` ahead of every other item.
    pub fn push_front(&mut self, item: WorkItem) {
        assert_eq!(item.group, self.key, "item {} pushed to wrong workset", item);
        let index = item.index;
        let (position, previous) = self.items.insert_full(index, item);
        assert!(previous.is_none(), "item #{} already queued", index);
        self.items.move_index(position, 0);
        self.high_water = self.high_water.max(self.items.len());
    }

    /// Remove the first `count` items.
    pub fn take_front(&mut self, count: usize) -> Vec<WorkItem> {
        assert!(
            count <= self.items.len(),
            "requested {} items from workset {} holding {}",
            count,
            self.key,
            self.items.len()
        );
        self.items.drain(..count).map(|(_, item)| item).collect()
    }

    /// Remove every item, in order.
    pub fn take_all(&mut self) -> Vec<WorkItem> {
        self.items.drain(..).map(|(_, item)| item).collect()
    }
}

/// Insertion-ordered mapping from group key to workset.
#[derive(Debug, Clone, Default)]
pub struct WorkQueue {
    worksets: IndexMap<GroupKey, Workset>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of worksets, including ones emptied by withdrawals.
    pub fn len(&self) -> usize {
        self.worksets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.worksets.is_empty()
    }

    /// Number of items over all worksets.
    pub fn item_count(&self) -> usize {
        self.worksets.values().map(Workset::len).sum()
    }

    /// Append `item` to the workset of its group, creating it at the back if needed.
    pub fn push(&mut self, item: WorkItem) {
        self.worksets
            .entry(item.group.clone())
            .or_insert_with(|| Workset::new(item.group.clone()))
            .push(item);
    }

    /// Put `item` first in its group and move that group to the front.
    pub fn push_front(&mut self, item: WorkItem) {
        let position = match self.worksets.get_index_of(&item.group) {
            Some(position) => position,
            None => {
                let key = item.group.clone();
                self.worksets
                    .insert_full(key.clone(), Workset::new(key))
                    .0
            }
        };
        self.worksets.move_index(position, 0);
        self.worksets[0].push_front(item);
    }

    pub fn head(&self) -> Option<&Workset> {
        self.worksets.first().map(|(_, ws)| ws)
    }

    pub fn take_head(&mut self) -> Option<Workset> {
        self.worksets.shift_remove_index(0).map(|(_, ws)| ws)
    }

    /// Remove a workset chosen uniformly at random.
    pub fn take_random<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<Workset> {
        if self.worksets.is_empty() {
            return None;
        }
        let position = rng.gen_range(0..self.worksets.len());
        self.worksets.shift_remove_index(position).map(|(_, ws)| ws)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Workset> {
        self.worksets.values_mut()
    }
}
