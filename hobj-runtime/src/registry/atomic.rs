//! Lock-free slot table.
//!
//! Each slot carries one atomic state word:
//!
//! ```text
//!  63                                20 19              0
//! ┌────────────────────────────────────┬────────────────┐
//! │  tag = (handle >> table_bits)      │    refcount    │
//! └────────────────────────────────────┴────────────────┘
//! ```
//!
//! plus three reserved words: `FREE` (all zeros), `CLAIMED` (an insert is
//! publishing the slot) and `DYING` (the last reference is tearing it down).
//! A lookup CAS-increments the refcount only if the tag matches and the slot
//! is live, so a count never moves from zero back to one and a stale handle
//! whose slot was reused by a newer handle fails the tag comparison.
//!
//! The table sits behind a `parking_lot::RwLock` that is write-locked only
//! while doubling. A table configured as non-growable is never write-locked,
//! and readers skip the lock entirely.
//!
//! A stale handle aliases a live one only if both share the slot index and
//! all 44 tag bits, i.e. their values differ by a multiple of
//! `2^(44 + table_bits)`.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;

use super::{Exhausted, Release, Shared, SlotTable, TableStats};
use crate::object::{Handle, Object};

const REFS_BITS: u32 = 20;
const REFS_MASK: u64 = (1 << REFS_BITS) - 1;
const TAG_MASK: u64 = (1 << (64 - REFS_BITS)) - 1;

const FREE: u64 = 0;
const CLAIMED: u64 = u64::MAX;
const DYING: u64 = u64::MAX - 1;

/// Highest refcount a live word may hold without colliding with the markers.
const MAX_REFS: u64 = REFS_MASK - 2;

#[inline]
fn tag_of(handle: Handle, bits: u32) -> u64 {
    (handle.into_raw() >> bits) & TAG_MASK
}

#[inline]
fn pack(tag: u64, refs: u64) -> u64 {
    (tag << REFS_BITS) | refs
}

#[inline]
fn is_live(state: u64) -> bool {
    state != FREE && state != CLAIMED && state != DYING
}

struct Slot {
    state: AtomicU64,
    handle: AtomicU64,
    object: AtomicPtr<Shared>,
}

impl Slot {
    fn free() -> Self {
        Self {
            state: AtomicU64::new(FREE),
            handle: AtomicU64::new(0),
            object: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

struct Slots {
    slots: Box<[Slot]>,
    bits: u32,
}

impl Slots {
    fn with_len(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| Slot::free()).collect(),
            bits: len.trailing_zeros(),
        }
    }

    fn slot(&self, handle: Handle) -> &Slot {
        &self.slots[handle.index(self.bits)]
    }

    fn try_claim(&self, next: &AtomicU64, limit: usize, object: *mut Shared) -> Option<Handle> {
        for _ in 0..limit.min(self.slots.len()) {
            let Some(handle) = Handle::from_raw(next.fetch_add(1, Ordering::Relaxed)) else {
                continue;
            };
            let slot = self.slot(handle);
            if slot
                .state
                .compare_exchange(FREE, CLAIMED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                slot.handle.store(handle.into_raw(), Ordering::Relaxed);
                slot.object.store(object, Ordering::Release);
                slot.state
                    .store(pack(tag_of(handle, self.bits), 1), Ordering::Release);
                return Some(handle);
            }
        }
        None
    }

    fn acquire(&self, handle: Handle) -> Option<Shared> {
        let slot = self.slot(handle);
        let tag = tag_of(handle, self.bits);
        let mut current = slot.state.load(Ordering::Acquire);
        loop {
            if !is_live(current) || current >> REFS_BITS != tag {
                return None;
            }
            assert!(
                current & REFS_MASK < MAX_REFS,
                "registry reference count overflow"
            );
            match slot.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        debug_assert_eq!(slot.handle.load(Ordering::Relaxed), handle.into_raw());

        // SAFETY: the reference taken above keeps the slot out of DYING, so
        // the pointer published before the live state word stays valid.
        let object = unsafe { &*slot.object.load(Ordering::Acquire) };
        Some(Shared::clone(object))
    }

    fn release(&self, handle: Handle, live: &AtomicUsize) -> Release {
        let slot = self.slot(handle);
        let tag = tag_of(handle, self.bits);
        let mut current = slot.state.load(Ordering::Acquire);
        loop {
            if !is_live(current) || current >> REFS_BITS != tag {
                return Release::Invalid;
            }
            let next = if current & REFS_MASK == 1 {
                DYING
            } else {
                current - 1
            };
            match slot.state.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) if next == DYING => break,
                Ok(_) => return Release::Alive,
                Err(actual) => current = actual,
            }
        }

        let object = slot.object.swap(ptr::null_mut(), Ordering::AcqRel);
        slot.handle.store(0, Ordering::Relaxed);
        slot.state.store(FREE, Ordering::Release);
        live.fetch_sub(1, Ordering::Relaxed);

        // SAFETY: winning the move to DYING makes this thread the only owner
        // of the boxed pointer, which `try_claim` created with `Box::into_raw`.
        Release::Dead(*unsafe { Box::from_raw(object) })
    }
}

pub(crate) struct AtomicTable {
    slots: RwLock<Slots>,
    next: AtomicU64,
    live: AtomicUsize,
    growths: AtomicU64,
    growable: bool,
    max_bits: u32,
    probe_limit: usize,
}

impl AtomicTable {
    pub(crate) fn new(initial_slots: usize, ceiling: usize, probe_limit: usize) -> Self {
        Self {
            slots: RwLock::new(Slots::with_len(initial_slots)),
            next: AtomicU64::new(1),
            live: AtomicUsize::new(0),
            growths: AtomicU64::new(0),
            growable: ceiling > initial_slots,
            max_bits: ceiling.trailing_zeros(),
            probe_limit,
        }
    }

    fn with_slots<R>(&self, f: impl FnOnce(&Slots) -> R) -> R {
        if self.growable {
            f(&*self.slots.read())
        } else {
            // SAFETY: a non-growable table is never write-locked, so shared
            // access cannot overlap a writer.
            f(unsafe { &*self.slots.data_ptr() })
        }
    }

    /// Double the table unless someone else already has.
    fn grow(&self, seen_bits: u32) -> bool {
        let mut guard = self.slots.write();
        if guard.bits != seen_bits {
            return true;
        }
        if guard.bits >= self.max_bits {
            return false;
        }

        let bits = guard.bits + 1;
        let len = 1usize << bits;
        let mut fresh: Vec<Slot> = Vec::new();
        if fresh.try_reserve_exact(len).is_err() {
            return false;
        }
        fresh.resize_with(len, Slot::free);

        // The write lock excludes every insert and release, so no slot is
        // CLAIMED or DYING here.
        for old in guard.slots.iter() {
            let state = old.state.load(Ordering::Relaxed);
            let Some(handle) = Handle::from_raw(old.handle.load(Ordering::Relaxed)) else {
                continue;
            };
            debug_assert!(is_live(state));
            let slot = &fresh[handle.index(bits)];
            slot.handle.store(handle.into_raw(), Ordering::Relaxed);
            slot.object
                .store(old.object.load(Ordering::Relaxed), Ordering::Relaxed);
            slot.state.store(
                pack(tag_of(handle, bits), state & REFS_MASK),
                Ordering::Relaxed,
            );
        }

        tracing::debug!(from = len / 2, to = len, "registry table grew");
        *guard = Slots {
            slots: fresh.into_boxed_slice(),
            bits,
        };
        self.growths.fetch_add(1, Ordering::Relaxed);
        true
    }
}

impl SlotTable for AtomicTable {
    fn insert(&self, object: Shared) -> Result<Handle, Exhausted> {
        let boxed = Box::into_raw(Box::new(object));
        let (mut claimed, mut bits) =
            self.with_slots(|s| (s.try_claim(&self.next, self.probe_limit, boxed), s.bits));
        // Each pass sees a strictly larger table, so this ends at the ceiling.
        while claimed.is_none() && self.growable && self.grow(bits) {
            // One lap of the doubled table reaches every residue.
            (claimed, bits) =
                self.with_slots(|s| (s.try_claim(&self.next, s.slots.len(), boxed), s.bits));
        }

        match claimed {
            Some(handle) => {
                self.live.fetch_add(1, Ordering::Relaxed);
                Ok(handle)
            }
            None => Err(Exhausted {
                // SAFETY: no slot claimed the pointer, so it is still ours.
                object: *unsafe { Box::from_raw(boxed) },
                capacity: self.with_slots(|s| s.slots.len()),
            }),
        }
    }

    fn acquire(&self, handle: Handle) -> Option<Shared> {
        self.with_slots(|s| s.acquire(handle))
    }

    fn release(&self, handle: Handle) -> Release {
        self.with_slots(|s| s.release(handle, &self.live))
    }

    fn refcount(&self, handle: Handle) -> Option<usize> {
        self.with_slots(|s| {
            let state = s.slot(handle).state.load(Ordering::Acquire);
            (is_live(state) && state >> REFS_BITS == tag_of(handle, s.bits))
                .then_some((state & REFS_MASK) as usize)
        })
    }

    /// Pins each matching object with a temporary reference, then visits
    /// without holding the table lock.
    fn visit(
        &self,
        tag: &str,
        visitor: &mut dyn FnMut(Handle, &dyn Object),
    ) -> Vec<(Handle, Shared)> {
        let mut pinned = Vec::new();
        let mut unpinned = Vec::new();
        self.with_slots(|s| {
            for slot in s.slots.iter() {
                if !is_live(slot.state.load(Ordering::Acquire)) {
                    continue;
                }
                let Some(handle) = Handle::from_raw(slot.handle.load(Ordering::Acquire)) else {
                    continue;
                };
                if let Some(object) = s.acquire(handle) {
                    if object.type_tag().is_a(tag) {
                        pinned.push((handle, object));
                    } else {
                        unpinned.push(handle);
                    }
                }
            }
        });

        for (handle, object) in &pinned {
            visitor(*handle, &**object);
        }

        let handles: Vec<Handle> = pinned
            .drain(..)
            .map(|(handle, _)| handle)
            .chain(unpinned)
            .collect();
        handles
            .into_iter()
            .filter_map(|handle| match self.release(handle) {
                Release::Dead(object) => Some((handle, object)),
                _ => None,
            })
            .collect()
    }

    fn stats(&self) -> TableStats {
        TableStats {
            live: self.live.load(Ordering::Relaxed),
            capacity: self.with_slots(|s| s.slots.len()),
            growths: self.growths.load(Ordering::Relaxed),
        }
    }
}

impl Drop for AtomicTable {
    fn drop(&mut self) {
        for slot in self.slots.get_mut().slots.iter_mut() {
            let object = *slot.object.get_mut();
            if !object.is_null() {
                // SAFETY: exclusive access; the pointer came from `Box::into_raw`.
                drop(unsafe { Box::from_raw(object) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Class, TypeTag};
    use std::sync::Arc;
    use std::thread;

    struct Probe(u32);

    impl Class for Probe {
        const TAG: TypeTag = TypeTag::new("probe");
    }

    fn shared(v: u32) -> Shared {
        Arc::new(Probe(v))
    }

    #[test]
    fn test_pack_layout() {
        let h = Handle::from_raw(0xABCD_0003).unwrap();
        let word = pack(tag_of(h, 2), 5);
        assert_eq!(word & REFS_MASK, 5);
        assert_eq!(word >> REFS_BITS, 0xABCD_0003 >> 2);
        assert!(is_live(word));
        assert!(!is_live(FREE));
        assert!(!is_live(pack(TAG_MASK, MAX_REFS + 1)));
    }

    #[test]
    fn test_insert_acquire_release() {
        let table = AtomicTable::new(4, 4, 4);
        let h = table.insert(shared(1)).ok().unwrap();

        assert_eq!(table.refcount(h), Some(1));
        assert!(table.acquire(h).is_some());
        assert_eq!(table.refcount(h), Some(2));
        assert!(matches!(table.release(h), Release::Alive));
        assert!(matches!(table.release(h), Release::Dead(_)));
        assert_eq!(table.refcount(h), None);
        assert!(matches!(table.release(h), Release::Invalid));
        assert_eq!(table.stats().live, 0);
    }

    #[test]
    fn test_grow_preserves_entries() {
        let table = AtomicTable::new(2, 1024, 2);
        let handles: Vec<_> = (0..100)
            .map(|i| table.insert(shared(i)).ok().unwrap())
            .collect();

        let stats = table.stats();
        assert_eq!(stats.live, 100);
        assert!(stats.capacity >= 128);
        for h in &handles {
            assert_eq!(table.refcount(*h), Some(1));
        }
        for h in handles {
            assert!(matches!(table.release(h), Release::Dead(_)));
        }
        assert_eq!(table.stats().live, 0);
    }

    #[test]
    fn test_fixed_table_exhausts() {
        let table = AtomicTable::new(2, 2, 2);
        table.insert(shared(0)).ok().unwrap();
        table.insert(shared(1)).ok().unwrap();
        let err = table.insert(shared(2)).err().unwrap();
        assert_eq!(err.capacity, 2);
    }

    #[test]
    fn test_stale_handle_rejected() {
        let table = AtomicTable::new(2, 2, 2);
        let first = table.insert(shared(0)).ok().unwrap();
        assert!(matches!(table.release(first), Release::Dead(_)));
        for i in 0..4 {
            let h = table.insert(shared(i)).ok().unwrap();
            assert!(table.acquire(first).is_none());
            assert!(matches!(table.release(h), Release::Dead(_)));
        }
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let table = Arc::new(AtomicTable::new(8, 8, 8));
        let h = table.insert(shared(9)).ok().unwrap();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        assert!(table.acquire(h).is_some());
                        assert!(matches!(table.release(h), Release::Alive));
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        assert_eq!(table.refcount(h), Some(1));
        assert!(matches!(table.release(h), Release::Dead(_)));
    }

    #[test]
    fn test_drop_frees_remaining_objects() {
        let object = shared(1);
        let table = AtomicTable::new(4, 4, 4);
        table.insert(Arc::clone(&object)).ok().unwrap();
        assert_eq!(Arc::strong_count(&object), 2);
        drop(table);
        assert_eq!(Arc::strong_count(&object), 1);
    }

    #[test]
    fn test_visit_returns_objects_it_released_last() {
        let table = AtomicTable::new(4, 4, 4);
        let h = table.insert(shared(5)).ok().unwrap();

        let dead = table.visit("probe", &mut |seen, _| {
            assert!(matches!(table.release(seen), Release::Alive));
        });
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].0, h);
        assert_eq!(table.stats().live, 0);
        assert_eq!(table.refcount(h), None);
    }
}
