//! Fixed-stride ring bookkeeping shared by all ring allocator variants.
//!
//! The ring state lives inside the allocator's shared segment, directly after
//! the common allocator header, followed by one refcount word per slot:
//!
//! ```text
//! [AllocatorHeader][RingState][refs[ring_size]][pad][items...]   (CPU)
//! [AllocatorHeader][RingState][ipc handle meta][refs[ring_size]] (device)
//! ```
//!
//! Items are allocated at `(rear_it + count) % ring_size`. Releasing a
//! non-rear item only drops its refcount to zero (a dead slot); the leading
//! run of dead slots is reclaimed when the rear is next freed. A slot's
//! refcount counts the queue row holding the message plus every outstanding
//! reader reference, so release order does not matter.

use std::sync::atomic::{AtomicU32, Ordering};

/// A cross-process test-and-set spin lock word. Zero means unlocked.
pub(crate) struct SpinGuard<'a> {
    word: &'a AtomicU32,
}

pub(crate) fn spin_lock(word: &AtomicU32) -> SpinGuard<'_> {
    while word
        .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        std::hint::spin_loop();
    }
    SpinGuard { word }
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.word.store(0, Ordering::Release);
    }
}

/// Ring allocator bookkeeping, identical in every variant.
///
/// `item_size`, `ring_size` and `data_offset` are written once at creation,
/// before the segment becomes reachable by peers; `count`/`rear_it` only
/// change under `lock`.
#[repr(C)]
pub struct RingState {
    pub item_size: u32,
    pub ring_size: u32,
    pub count: AtomicU32,
    pub rear_it: AtomicU32,
    pub data_offset: u32,
    lock: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<RingState>() == 24);

/// First offset past the per-slot refcount column, rounded so item strides
/// start 8-byte aligned.
pub(crate) fn data_offset_for(layout_size: usize, ring_size: u32) -> u32 {
    let end = layout_size + ring_size as usize * std::mem::size_of::<u32>();
    (end as u32).div_ceil(8) * 8
}

/// Initialize ring state in freshly zeroed shared memory.
///
/// # Safety
/// `state` must point at writable, zeroed memory inside a segment not yet
/// visible to any peer.
pub(crate) unsafe fn init_ring(state: *mut RingState, item_size: u32, ring_size: u32, data_offset: u32) {
    (*state).item_size = item_size;
    (*state).ring_size = ring_size;
    (*state).data_offset = data_offset;
    // count, rear_it and lock stay zero
}

/// Borrowed view over one ring's shared state and refcount column.
pub(crate) struct RingOps<'a> {
    pub state: &'a RingState,
    pub refs: &'a [AtomicU32],
}

impl<'a> RingOps<'a> {
    fn lock(&self) -> SpinGuard<'a> {
        spin_lock(&self.state.lock)
    }

    /// Map an offset back to its slot index. `None` for offsets outside the
    /// data region or not on an item-stride boundary.
    pub fn slot_of(&self, offset: u32) -> Option<usize> {
        let s = self.state;
        if offset < s.data_offset {
            return None;
        }
        let rel = offset - s.data_offset;
        if rel % s.item_size != 0 {
            return None;
        }
        let slot = (rel / s.item_size) as usize;
        (slot < s.ring_size as usize).then_some(slot)
    }

    /// Claim the next slot. The requested length is ignored (fixed stride);
    /// a full ring is a normal `None`, not an error.
    pub fn allocate(&self, len: usize) -> Option<u32> {
        debug_assert!(len <= self.state.item_size as usize);
        let _g = self.lock();
        let s = self.state;
        let count = s.count.load(Ordering::Relaxed);
        if count == s.ring_size {
            return None;
        }
        let slot = ((s.rear_it.load(Ordering::Relaxed) + count) % s.ring_size) as usize;
        self.refs[slot].store(1, Ordering::Relaxed);
        s.count.store(count + 1, Ordering::Relaxed);
        Some(s.data_offset + slot as u32 * s.item_size)
    }

    /// Drop one reference to an allocation. At zero the slot is dead; the
    /// leading run of dead slots is reclaimed eagerly.
    pub fn deallocate(&self, offset: u32) {
        let Some(slot) = self.slot_of(offset) else {
            debug_assert!(false, "deallocate of foreign offset {offset}");
            log::warn!("deallocate ignored: offset {} is not an allocation", offset);
            return;
        };
        let _g = self.lock();
        let prev = self.refs[slot].load(Ordering::Relaxed);
        if prev == 0 {
            log::warn!("deallocate ignored: slot {} already free", slot);
            return;
        }
        self.refs[slot].store(prev - 1, Ordering::Relaxed);
        if prev == 1 {
            let s = self.state;
            let mut rear = s.rear_it.load(Ordering::Relaxed);
            let mut count = s.count.load(Ordering::Relaxed);
            while count > 0 && self.refs[rear as usize].load(Ordering::Relaxed) == 0 {
                rear = (rear + 1) % s.ring_size;
                count -= 1;
            }
            s.rear_it.store(rear, Ordering::Relaxed);
            s.count.store(count, Ordering::Relaxed);
        }
    }

    /// Add a reference to a live allocation.
    pub fn share(&self, offset: u32) {
        let Some(slot) = self.slot_of(offset) else {
            debug_assert!(false, "share of foreign offset {offset}");
            return;
        };
        let _g = self.lock();
        let prev = self.refs[slot].load(Ordering::Relaxed);
        if prev == 0 {
            log::warn!("share ignored: slot {} is not live", slot);
            return;
        }
        self.refs[slot].store(prev + 1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(item_size: u32, ring_size: u32) -> (Box<RingState>, Vec<AtomicU32>) {
        let data_offset = data_offset_for(36, ring_size);
        let state = Box::new(RingState {
            item_size,
            ring_size,
            count: AtomicU32::new(0),
            rear_it: AtomicU32::new(0),
            data_offset,
            lock: AtomicU32::new(0),
        });
        let refs = (0..ring_size).map(|_| AtomicU32::new(0)).collect();
        (state, refs)
    }

    #[test]
    fn out_of_order_release_reclaims_leading_run() {
        let (state, refs) = fixture(16, 4);
        let ops = RingOps {
            state: &state,
            refs: &refs,
        };
        let a = ops.allocate(0).unwrap();
        let b = ops.allocate(0).unwrap();
        let c = ops.allocate(0).unwrap();

        // Free the middle first: slot dies but rear can't move
        ops.deallocate(b);
        assert_eq!(state.count.load(Ordering::Relaxed), 3);
        assert_eq!(state.rear_it.load(Ordering::Relaxed), 0);

        // Freeing the rear reclaims both dead slots at once
        ops.deallocate(a);
        assert_eq!(state.count.load(Ordering::Relaxed), 1);
        assert_eq!(state.rear_it.load(Ordering::Relaxed), 2);

        ops.deallocate(c);
        assert_eq!(state.count.load(Ordering::Relaxed), 0);
        assert_eq!(state.rear_it.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn share_delays_release() {
        let (state, refs) = fixture(8, 2);
        let ops = RingOps {
            state: &state,
            refs: &refs,
        };
        let a = ops.allocate(0).unwrap();
        ops.share(a);
        ops.deallocate(a);
        assert_eq!(state.count.load(Ordering::Relaxed), 1, "still referenced");
        ops.deallocate(a);
        assert_eq!(state.count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn conservation_over_cycles() {
        let (state, refs) = fixture(8, 3);
        let ops = RingOps {
            state: &state,
            refs: &refs,
        };
        for _ in 0..10 {
            let offs: Vec<u32> = (0..3).map(|_| ops.allocate(0).unwrap()).collect();
            assert!(ops.allocate(0).is_none());
            for o in offs {
                ops.deallocate(o);
            }
            assert_eq!(state.count.load(Ordering::Relaxed), 0);
        }
    }

    #[test]
    fn rejects_foreign_offsets() {
        let (state, refs) = fixture(8, 3);
        let ops = RingOps {
            state: &state,
            refs: &refs,
        };
        assert_eq!(ops.slot_of(0), None);
        assert_eq!(ops.slot_of(state.data_offset + 3), None);
        assert_eq!(
            ops.slot_of(state.data_offset + 3 * state.item_size),
            None,
            "one past the last slot"
        );
    }
}
