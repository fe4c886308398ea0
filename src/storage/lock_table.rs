//! # In-Process Byte-Range Lock Table
//!
//! Tracks byte-position locks held within this process so that concurrent
//! holders of the same file coalesce onto a single OS advisory lock. Each
//! position has a slot with a shared-holder count and an exclusive flag:
//!
//! - Shared holders of one position are reference-counted; the OS lock is
//!   taken when the count rises 0→1 and dropped when it falls back to 0.
//! - An exclusive request blocks until the slot drains completely.
//!
//! Blocked acquirers wait on one condvar shared across all positions. A
//! release that drains a slot wakes every waiter to re-contend (a shared
//! condvar cannot safely wake just one without losing wakeups for other
//! positions), so acquisition order under contention is unspecified. Slots
//! are removed from the map once empty, so the table's size is bounded by
//! the number of distinct positions currently held.

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct Slot {
    shared: u32,
    exclusive: bool,
}

#[derive(Debug, Default)]
pub struct LockTable {
    slots: Mutex<HashMap<u64, Slot>>,
    released: Condvar,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until a shared hold on `position` is granted. Returns true when
    /// this hold is the first at the position, in which case the caller takes
    /// the OS advisory lock.
    pub fn acquire_shared(&self, position: u64) -> bool {
        let mut slots = self.slots.lock();
        loop {
            let slot = slots.entry(position).or_default();
            if !slot.exclusive {
                slot.shared += 1;
                return slot.shared == 1;
            }
            self.released.wait(&mut slots);
        }
    }

    /// Blocks until an exclusive hold on `position` is granted. The caller
    /// always takes the OS advisory lock afterwards.
    pub fn acquire_exclusive(&self, position: u64) {
        let mut slots = self.slots.lock();
        loop {
            let slot = slots.entry(position).or_default();
            if !slot.exclusive && slot.shared == 0 {
                slot.exclusive = true;
                return;
            }
            self.released.wait(&mut slots);
        }
    }

    /// Drops one shared hold. Returns true when the position drained and the
    /// caller must release the OS advisory lock.
    pub fn release_shared(&self, position: u64) -> bool {
        let mut slots = self.slots.lock();
        let drained = match slots.get_mut(&position) {
            Some(slot) => {
                slot.shared = slot.shared.saturating_sub(1);
                slot.shared == 0 && !slot.exclusive
            }
            None => false,
        };
        if drained {
            slots.remove(&position);
            self.released.notify_all();
        }
        drained
    }

    /// Drops the exclusive hold. Always drains; the caller releases the OS
    /// advisory lock.
    pub fn release_exclusive(&self, position: u64) -> bool {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&position) {
            slot.exclusive = false;
            if slot.shared == 0 {
                slots.remove(&position);
            }
        }
        self.released.notify_all();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn shared_holders_coalesce() {
        let table = LockTable::new();
        assert!(table.acquire_shared(7));
        assert!(!table.acquire_shared(7));
        assert!(!table.release_shared(7));
        assert!(table.release_shared(7));
    }

    #[test]
    fn distinct_positions_are_independent() {
        let table = LockTable::new();
        assert!(table.acquire_shared(0));
        assert!(table.acquire_shared(1));
        table.acquire_exclusive(2);
        assert!(table.release_shared(0));
        assert!(table.release_shared(1));
        assert!(table.release_exclusive(2));
    }

    #[test]
    fn exclusive_waits_for_shared_to_drain() {
        let table = Arc::new(LockTable::new());
        table.acquire_shared(3);

        let contender = Arc::clone(&table);
        let handle = thread::spawn(move || {
            contender.acquire_exclusive(3);
            contender.release_exclusive(3);
        });

        // the exclusive acquire above cannot finish until this release
        thread::sleep(std::time::Duration::from_millis(20));
        table.release_shared(3);
        handle.join().unwrap();
    }

    #[test]
    fn empty_slots_are_removed() {
        let table = LockTable::new();
        table.acquire_shared(9);
        table.release_shared(9);
        assert!(table.slots.lock().is_empty());
    }
}
