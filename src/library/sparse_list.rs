//! Partially fetched view over a server-side list.
//!
//! The server reports an authoritative total; pages arrive in any order and
//! fill slots by absolute index. Slots never fetched read as `None`, which
//! is distinct from an index outside `[0, total)` (an `OutOfRange` error).
//!
//! All mutations take the write lock for their full duration, so `update`,
//! `insert_item` and `remove_item` never interleave. Readers may run
//! concurrently with each other.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use super::item::Item;
use crate::error::{CliError, CliResult};

#[derive(Debug, Default)]
struct Slots {
    total: usize,
    items: BTreeMap<usize, Item>,
    /// Bumped by `clear`; pages requested before a clear carry the old value.
    generation: u64,
}

#[derive(Debug, Default)]
pub struct SparsePagedList {
    slots: RwLock<Slots>,
}

impl SparsePagedList {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_slots(&self) -> RwLockReadGuard<'_, Slots> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slots(&self) -> RwLockWriteGuard<'_, Slots> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge one page: reset the total and overwrite `[start, start + len)`.
    ///
    /// Slots outside the range are left alone, even past a shrunk total;
    /// reads bounds-check against the current total instead.
    pub fn update(&self, total: usize, start: usize, items: Vec<Item>) {
        let mut slots = self.write_slots();
        Self::merge(&mut slots, total, start, items);
    }

    /// Current generation, to be passed back to [`Self::update_if`].
    pub fn generation(&self) -> u64 {
        self.read_slots().generation
    }

    /// Merge a page only if the list has not been cleared since `generation`
    /// was read. The check and the merge happen under one write lock.
    pub fn update_if(&self, generation: u64, total: usize, start: usize, items: Vec<Item>) -> bool {
        let mut slots = self.write_slots();
        if slots.generation != generation {
            debug!(start, "discarding page requested before the list was cleared");
            return false;
        }
        Self::merge(&mut slots, total, start, items);
        true
    }

    fn merge(slots: &mut Slots, total: usize, start: usize, items: Vec<Item>) {
        slots.total = total;
        let len = items.len();
        for (offset, item) in items.into_iter().enumerate() {
            let index = start + offset;
            if index >= total {
                debug!(index, total, "dropping page entries past the reported total");
                break;
            }
            slots.items.insert(index, item);
        }
        debug!(total, start, len, "page merged");
    }

    /// Item at `index`, or `None` if that slot has not been fetched yet.
    pub fn get_item(&self, index: usize) -> CliResult<Option<Item>> {
        let slots = self.read_slots();
        if index >= slots.total {
            return Err(CliError::OutOfRange {
                index,
                total: slots.total,
            });
        }
        Ok(slots.items.get(&index).cloned())
    }

    /// Position of `item` among the fetched slots, compared by id.
    pub fn find_item(&self, item: &Item) -> Option<usize> {
        let slots = self.read_slots();
        slots
            .items
            .range(..slots.total)
            .find(|(_, candidate)| *candidate == item)
            .map(|(index, _)| *index)
    }

    /// Install `item` at `index`, shifting later slots up by one.
    ///
    /// `index` may equal the total (append).
    pub fn insert_item(&self, index: usize, item: Item) -> CliResult<()> {
        let mut slots = self.write_slots();
        if index > slots.total {
            return Err(CliError::OutOfRange {
                index,
                total: slots.total,
            });
        }
        let tail = slots.items.split_off(&index);
        slots
            .items
            .extend(tail.into_iter().map(|(i, item)| (i + 1, item)));
        slots.items.insert(index, item);
        slots.total += 1;
        Ok(())
    }

    /// Drop the slot at `index`, shifting later slots down by one.
    ///
    /// Returns the removed item if it had been fetched.
    pub fn remove_item(&self, index: usize) -> CliResult<Option<Item>> {
        let mut slots = self.write_slots();
        if index >= slots.total {
            return Err(CliError::OutOfRange {
                index,
                total: slots.total,
            });
        }
        let removed = slots.items.remove(&index);
        let tail = slots.items.split_off(&index);
        slots
            .items
            .extend(tail.into_iter().map(|(i, item)| (i - 1, item)));
        slots.total -= 1;
        Ok(removed)
    }

    pub fn clear(&self) {
        let mut slots = self.write_slots();
        slots.items.clear();
        slots.total = 0;
        slots.generation += 1;
    }

    pub fn total_count(&self) -> usize {
        self.read_slots().total
    }

    /// Number of populated slots inside the current total.
    pub fn fetched_count(&self) -> usize {
        let slots = self.read_slots();
        slots.items.range(..slots.total).count()
    }

    /// First unfetched index in `[start, start + count)`, clamped to the total.
    pub fn first_missing(&self, start: usize, count: usize) -> Option<usize> {
        let slots = self.read_slots();
        let end = start.saturating_add(count).min(slots.total);
        (start..end).find(|i| !slots.items.contains_key(i))
    }
}
