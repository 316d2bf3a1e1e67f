// Copyright 2025 the Broadleaf Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Lock-free fixed-capacity slot allocator.
//!
//! [`FreeList`] hands out slots of a pre-sized arena. Free slots form an intrusive
//! singly linked list whose head is a packed `(index, tag)` word updated by
//! compare-and-swap; the tag is bumped on every push and pop so that a head that
//! was popped and pushed back between a load and a CAS never matches (ABA).
//!
//! Every slot also carries a generation counter that is bumped on release, so a
//! [`NodeHandle`] kept past its slot's release is detected as stale.

use core::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Sentinel index meaning "no slot".
pub const INVALID_INDEX: u32 = u32::MAX;

/// Generation-tagged handle to an arena slot.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct NodeHandle {
    index: u32,
    generation: u32,
}

impl NodeHandle {
    /// Slot index in the arena.
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation of the slot at the time the handle was produced.
    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

#[inline(always)]
const fn pack(index: u32, tag: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

#[allow(
    clippy::cast_possible_truncation,
    reason = "Unpacking the two 32-bit halves of the head word."
)]
#[inline(always)]
const fn unpack(word: u64) -> (u32, u32) {
    (word as u32, (word >> 32) as u32)
}

/// Slots linked locally, to be returned to a [`FreeList`] with a single CAS.
///
/// Build with [`FreeList::add_to_batch`], hand back with [`FreeList::release_batch`].
#[derive(Debug)]
pub struct ReleaseBatch {
    first: u32,
    last: u32,
    count: usize,
}

impl Default for ReleaseBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ReleaseBatch {
    /// An empty batch.
    pub const fn new() -> Self {
        Self {
            first: INVALID_INDEX,
            last: INVALID_INDEX,
            count: 0,
        }
    }

    /// Number of slots in the batch.
    pub const fn len(&self) -> usize {
        self.count
    }

    /// Whether the batch holds no slots.
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Fixed-capacity arena of `T` with lock-free acquire and release.
pub struct FreeList<T> {
    slots: Box<[T]>,
    next_free: Box<[AtomicU32]>,
    generations: Box<[AtomicU32]>,
    /// Packed `(index, tag)` of the free list head.
    first_free_and_tag: AtomicU64,
    /// Slots at or past this index have never been handed out.
    first_never_used: AtomicU32,
    in_use: AtomicUsize,
}

impl<T: fmt::Debug> fmt::Debug for FreeList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeList")
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .finish_non_exhaustive()
    }
}

impl<T: Default> FreeList<T> {
    /// Create an arena with room for `capacity` slots.
    ///
    /// The capacity is clamped to `u32::MAX - 1` so that [`INVALID_INDEX`] never names a slot.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(INVALID_INDEX as usize - 1);
        Self {
            slots: (0..capacity).map(|_| T::default()).collect(),
            next_free: (0..capacity)
                .map(|_| AtomicU32::new(INVALID_INDEX))
                .collect(),
            generations: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
            first_free_and_tag: AtomicU64::new(pack(INVALID_INDEX, 0)),
            first_never_used: AtomicU32::new(0),
            in_use: AtomicUsize::new(0),
        }
    }
}

impl<T> FreeList<T> {
    /// Total number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently handed out.
    #[inline]
    pub fn used(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Take a free slot, or `None` when the arena is exhausted.
    ///
    /// The slot keeps whatever state it had when it was released; callers reset it.
    pub fn acquire(&self) -> Option<NodeHandle> {
        let mut head = self.first_free_and_tag.load(Ordering::Acquire);
        loop {
            let (index, tag) = unpack(head);
            if index == INVALID_INDEX {
                break;
            }
            let next = self.next_free[index as usize].load(Ordering::Acquire);
            match self.first_free_and_tag.compare_exchange_weak(
                head,
                pack(next, tag.wrapping_add(1)),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(self.hand_out(index)),
                Err(actual) => head = actual,
            }
        }

        #[allow(
            clippy::cast_possible_truncation,
            reason = "Capacity is clamped below u32::MAX at construction."
        )]
        let capacity = self.slots.len() as u32;
        let index = self
            .first_never_used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |i| {
                (i < capacity).then_some(i + 1)
            })
            .ok()?;
        Some(self.hand_out(index))
    }

    fn hand_out(&self, index: u32) -> NodeHandle {
        self.next_free[index as usize].store(INVALID_INDEX, Ordering::Relaxed);
        self.in_use.fetch_add(1, Ordering::AcqRel);
        NodeHandle {
            index,
            generation: self.generations[index as usize].load(Ordering::Acquire),
        }
    }

    /// Bump the generation of a live slot. Returns `false` for a stale handle.
    fn retire(&self, handle: NodeHandle) -> bool {
        let Some(generation) = self.generations.get(handle.index as usize) else {
            return false;
        };
        generation
            .compare_exchange(
                handle.generation,
                handle.generation.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Return a single slot to the free list.
    ///
    /// Releasing a stale handle is a programmer error: it asserts in debug builds and is
    /// ignored otherwise.
    pub fn release(&self, handle: NodeHandle) {
        if !self.retire(handle) {
            debug_assert!(false, "release of stale node handle {handle:?}");
            return;
        }
        self.splice(handle.index, handle.index, 1);
    }

    /// Add a live slot to `batch`. The slot becomes stale immediately but is only reusable
    /// once the batch is released.
    pub fn add_to_batch(&self, batch: &mut ReleaseBatch, handle: NodeHandle) {
        if !self.retire(handle) {
            debug_assert!(false, "batching of stale node handle {handle:?}");
            return;
        }
        self.next_free[handle.index as usize].store(batch.first, Ordering::Relaxed);
        if batch.last == INVALID_INDEX {
            batch.last = handle.index;
        }
        batch.first = handle.index;
        batch.count += 1;
    }

    /// Return every slot of `batch` to the free list in one atomic link operation.
    pub fn release_batch(&self, batch: ReleaseBatch) {
        if batch.is_empty() {
            return;
        }
        self.splice(batch.first, batch.last, batch.count);
    }

    /// Push the chain `first..=last` (already linked through `next_free`) onto the head.
    fn splice(&self, first: u32, last: u32, count: usize) {
        let mut head = self.first_free_and_tag.load(Ordering::Acquire);
        loop {
            let (index, tag) = unpack(head);
            self.next_free[last as usize].store(index, Ordering::Release);
            match self.first_free_and_tag.compare_exchange_weak(
                head,
                pack(first, tag.wrapping_add(1)),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
        self.in_use.fetch_sub(count, Ordering::AcqRel);
    }

    /// Whether `handle` still names the slot it was issued for.
    #[inline]
    pub fn is_live(&self, handle: NodeHandle) -> bool {
        self.generations
            .get(handle.index as usize)
            .is_some_and(|g| g.load(Ordering::Acquire) == handle.generation)
    }

    /// Borrow the slot behind a live handle.
    #[inline]
    pub fn get(&self, handle: NodeHandle) -> Option<&T> {
        self.is_live(handle)
            .then(|| &self.slots[handle.index as usize])
    }

    /// Handle for the current occupant of `index`.
    #[inline]
    pub(crate) fn handle_at(&self, index: u32) -> NodeHandle {
        NodeHandle {
            index,
            generation: self.generations[index as usize].load(Ordering::Acquire),
        }
    }

    /// Borrow a slot by raw index.
    #[inline(always)]
    pub(crate) fn slot(&self, index: u32) -> &T {
        &self.slots[index as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn acquire_until_exhausted_then_reuse() {
        let list: FreeList<u8> = FreeList::new(3);
        let a = list.acquire().unwrap();
        let b = list.acquire().unwrap();
        let c = list.acquire().unwrap();
        assert!(list.acquire().is_none());
        assert_eq!(list.used(), 3);

        list.release(b);
        assert_eq!(list.used(), 2);
        let d = list.acquire().unwrap();
        assert_eq!(d.index(), b.index());
        assert_ne!(d, b, "reused slot must carry a new generation");
        assert!(!list.is_live(b));
        assert!(list.is_live(d));
        assert!(list.get(b).is_none());
        assert!(list.get(a).is_some());
        let _ = c;
    }

    #[test]
    fn batch_release_returns_all_slots() {
        let list: FreeList<u8> = FreeList::new(8);
        let handles: Vec<_> = (0..8).map(|_| list.acquire().unwrap()).collect();
        let mut batch = ReleaseBatch::new();
        for &h in &handles[2..6] {
            list.add_to_batch(&mut batch, h);
        }
        assert_eq!(batch.len(), 4);
        // Batched slots are stale before the batch is released, but still not reusable.
        assert!(!list.is_live(handles[3]));
        assert!(list.acquire().is_none());
        list.release_batch(batch);
        assert_eq!(list.used(), 4);

        let mut again: Vec<_> = (0..4).map(|_| list.acquire().unwrap().index()).collect();
        again.sort_unstable();
        assert_eq!(again, vec![2, 3, 4, 5]);
        assert!(list.acquire().is_none());
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn stale_release_is_ignored() {
        let list: FreeList<u8> = FreeList::new(2);
        let a = list.acquire().unwrap();
        list.release(a);
        list.release(a);
        assert_eq!(list.used(), 0);
    }

    #[test]
    fn concurrent_acquire_release_keeps_counts() {
        let list: Arc<FreeList<u32>> = Arc::new(FreeList::new(64));
        thread::scope(|s| {
            for _ in 0..4 {
                let list = &list;
                s.spawn(move || {
                    for _ in 0..2_000 {
                        let mut held = Vec::new();
                        for _ in 0..8 {
                            if let Some(h) = list.acquire() {
                                held.push(h);
                            }
                        }
                        let mut batch = ReleaseBatch::new();
                        for (i, h) in held.into_iter().enumerate() {
                            if i % 2 == 0 {
                                list.release(h);
                            } else {
                                list.add_to_batch(&mut batch, h);
                            }
                        }
                        list.release_batch(batch);
                    }
                });
            }
        });
        assert_eq!(list.used(), 0);
        let all: Vec<_> = (0..64).map(|_| list.acquire().unwrap().index()).collect();
        let unique: std::collections::BTreeSet<_> = all.iter().copied().collect();
        assert_eq!(unique.len(), 64);
        assert!(list.acquire().is_none());
    }
}
