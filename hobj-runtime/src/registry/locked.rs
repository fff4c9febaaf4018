//! Lock-based slot table.
//!
//! One `parking_lot::Mutex` guards the whole table. Every refcount change and
//! every insert or removal is O(1) under the lock; doubling rehashes the live
//! entries and is O(n).

use parking_lot::Mutex;

use super::{Exhausted, Release, Shared, SlotTable, TableStats};
use crate::object::{Handle, Object};

struct Entry {
    handle: Handle,
    refs: usize,
    object: Shared,
}

struct Table {
    slots: Vec<Option<Entry>>,
    bits: u32,
    next: u64,
    live: usize,
    growths: u64,
}

impl Table {
    fn take_next(&mut self) -> Handle {
        loop {
            let raw = self.next;
            self.next = self.next.wrapping_add(1);
            if let Some(handle) = Handle::from_raw(raw) {
                return handle;
            }
        }
    }

    /// Scan up to `limit` fresh handle values for one whose slot is free.
    ///
    /// A full lap of `slots.len()` values visits every residue once.
    fn probe(&mut self, limit: usize) -> Option<Handle> {
        for _ in 0..limit.min(self.slots.len()) {
            let candidate = self.take_next();
            if self.slots[candidate.index(self.bits)].is_none() {
                return Some(candidate);
            }
        }
        None
    }

    /// Double the table, rehashing every live entry.
    ///
    /// Two handles with distinct residues modulo `n` keep distinct residues
    /// modulo `2n`, so placement never collides. At most half the doubled
    /// table is occupied afterwards.
    fn grow(&mut self, max_bits: u32) -> bool {
        if self.bits >= max_bits {
            return false;
        }
        let bits = self.bits + 1;
        let len = 1usize << bits;
        let mut slots: Vec<Option<Entry>> = Vec::new();
        if slots.try_reserve_exact(len).is_err() {
            return false;
        }
        slots.resize_with(len, || None);

        for entry in self.slots.drain(..).flatten() {
            let index = entry.handle.index(bits);
            debug_assert!(slots[index].is_none(), "rehash collision at {index}");
            slots[index] = Some(entry);
        }

        tracing::debug!(from = len / 2, to = len, "registry table grew");
        self.slots = slots;
        self.bits = bits;
        self.growths += 1;
        true
    }

    fn entry_mut(&mut self, handle: Handle) -> Option<&mut Entry> {
        let index = handle.index(self.bits);
        self.slots[index]
            .as_mut()
            .filter(|entry| entry.handle == handle)
    }
}

pub(crate) struct LockedTable {
    table: Mutex<Table>,
    max_bits: u32,
    probe_limit: usize,
}

impl LockedTable {
    pub(crate) fn new(initial_slots: usize, ceiling: usize, probe_limit: usize) -> Self {
        let mut slots = Vec::new();
        slots.resize_with(initial_slots, || None);
        Self {
            table: Mutex::new(Table {
                slots,
                bits: initial_slots.trailing_zeros(),
                next: 1,
                live: 0,
                growths: 0,
            }),
            max_bits: ceiling.trailing_zeros(),
            probe_limit,
        }
    }
}

impl SlotTable for LockedTable {
    fn insert(&self, object: Shared) -> Result<Handle, Exhausted> {
        let mut table = self.table.lock();
        let probed = table.probe(self.probe_limit);
        let handle = match probed {
            Some(handle) => Some(handle),
            None if table.grow(self.max_bits) => {
                let lap = table.slots.len();
                table.probe(lap)
            }
            None => None,
        };
        let Some(handle) = handle else {
            return Err(Exhausted {
                object,
                capacity: table.slots.len(),
            });
        };

        let index = handle.index(table.bits);
        table.slots[index] = Some(Entry {
            handle,
            refs: 1,
            object,
        });
        table.live += 1;
        Ok(handle)
    }

    fn acquire(&self, handle: Handle) -> Option<Shared> {
        let mut table = self.table.lock();
        let entry = table.entry_mut(handle)?;
        assert!(entry.refs < usize::MAX, "registry reference count overflow");
        entry.refs += 1;
        Some(Shared::clone(&entry.object))
    }

    fn release(&self, handle: Handle) -> Release {
        let mut table = self.table.lock();
        let Some(entry) = table.entry_mut(handle) else {
            return Release::Invalid;
        };
        entry.refs -= 1;
        if entry.refs > 0 {
            return Release::Alive;
        }

        let index = handle.index(table.bits);
        table.live -= 1;
        match table.slots[index].take() {
            Some(entry) => Release::Dead(entry.object),
            None => Release::Invalid,
        }
    }

    fn refcount(&self, handle: Handle) -> Option<usize> {
        self.table.lock().entry_mut(handle).map(|entry| entry.refs)
    }

    fn visit(
        &self,
        tag: &str,
        visitor: &mut dyn FnMut(Handle, &dyn Object),
    ) -> Vec<(Handle, Shared)> {
        let table = self.table.lock();
        for entry in table.slots.iter().flatten() {
            if entry.object.type_tag().is_a(tag) {
                visitor(entry.handle, &*entry.object);
            }
        }
        // The lock pins every entry, so the visit never drops a count.
        Vec::new()
    }

    fn stats(&self) -> TableStats {
        let table = self.table.lock();
        TableStats {
            live: table.live,
            capacity: table.slots.len(),
            growths: table.growths,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Class, TypeTag};
    use std::sync::Arc;

    struct Probe(u32);

    impl Class for Probe {
        const TAG: TypeTag = TypeTag::new("probe");
    }

    fn shared(v: u32) -> Shared {
        Arc::new(Probe(v))
    }

    #[test]
    fn test_insert_acquire_release() {
        let table = LockedTable::new(4, 4, 4);
        let h = table.insert(shared(1)).ok().unwrap();

        assert_eq!(table.refcount(h), Some(1));
        assert!(table.acquire(h).is_some());
        assert_eq!(table.refcount(h), Some(2));
        assert!(matches!(table.release(h), Release::Alive));
        assert!(matches!(table.release(h), Release::Dead(_)));
        assert_eq!(table.refcount(h), None);
        assert!(matches!(table.release(h), Release::Invalid));
    }

    #[test]
    fn test_grows_when_probe_fails() {
        let table = LockedTable::new(2, 64, 2);
        let handles: Vec<_> = (0..10)
            .map(|i| table.insert(shared(i)).ok().unwrap())
            .collect();

        let stats = table.stats();
        assert_eq!(stats.live, 10);
        assert!(stats.capacity >= 16);
        assert!(stats.growths >= 3);
        for h in handles {
            assert_eq!(table.refcount(h), Some(1));
        }
    }

    #[test]
    fn test_exhausted_at_ceiling() {
        let table = LockedTable::new(2, 2, 2);
        table.insert(shared(0)).ok().unwrap();
        table.insert(shared(1)).ok().unwrap();

        let err = table.insert(shared(2)).err().unwrap();
        assert_eq!(err.capacity, 2);
        assert_eq!(table.stats().live, 2);
    }

    #[test]
    fn test_stale_handle_same_slot() {
        let table = LockedTable::new(2, 2, 2);
        let first = table.insert(shared(0)).ok().unwrap();
        assert!(matches!(table.release(first), Release::Dead(_)));

        // Reuse the slot with a newer handle; the old one must stay dead.
        for i in 0..4 {
            let h = table.insert(shared(i)).ok().unwrap();
            assert_ne!(h, first);
            assert!(table.acquire(first).is_none());
            assert!(matches!(table.release(h), Release::Dead(_)));
        }
    }
}
