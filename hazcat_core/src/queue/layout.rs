//! Shared layout of a topic's message queue segment.
//!
//! ```text
//! [QueueHeader]
//! [RefBits; len]                        one record per ring row
//! [Entry; len] x num_domains            column-major: one column per domain
//! ```
//!
//! Rows carry no payload - only `(allocator id, offset, len)` entries per
//! domain column plus the reference bits that drive lazy cross-domain copies
//! and refcount-based reclamation.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64};

use crate::memory::shm::SharedMemorySegment;

/// Upper bound of memory domains (entry columns) per topic.
pub const DOMAINS_PER_TOPIC: usize = 32;

/// "HZCATMQ1" - written last during creation, validated on attach.
pub(crate) const QUEUE_MAGIC: u64 = 0x485A_4341_544D_5131;

/// Queue segment header. `index` is the shared write cursor; everything
/// structural (`len`, `num_domains`, `domains`) only changes under the
/// exclusive file lock.
#[repr(C)]
pub struct QueueHeader {
    pub magic: AtomicU64,
    /// Next row to publish into, kept in [0, len) by a CAS after each
    /// fetch-add; readers tolerate the transient overshoot by reducing
    /// modulo `len` themselves.
    pub index: AtomicU32,
    /// Ring length in rows.
    pub len: AtomicU32,
    /// Active domain columns, in [1, DOMAINS_PER_TOPIC].
    pub num_domains: AtomicU32,
    /// Domain id per column; column 0 is always CPU.
    pub domains: [AtomicU32; DOMAINS_PER_TOPIC],
    pub pub_count: AtomicU16,
    pub sub_count: AtomicU16,
}

const _: () = assert!(std::mem::size_of::<QueueHeader>() == 152);

/// Per-row reference record.
#[repr(C)]
pub struct RefBits {
    /// Subscribers that have not taken this row yet; 0 means the row is empty.
    pub interest_count: AtomicU32,
    /// Bitmask of domain columns holding a valid copy of this row's message.
    pub availability: AtomicU32,
    /// Row spin lock word (test-and-set; zero = unlocked).
    pub lock: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<RefBits>() == 12);

/// One message reference: which allocator, where inside it, how long.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Entry {
    pub alloc_shmem_id: u32,
    pub offset: u32,
    pub len: u32,
}

const _: () = assert!(std::mem::size_of::<Entry>() == 12);

pub(crate) const fn ref_bits_offset(i: u32) -> usize {
    std::mem::size_of::<QueueHeader>() + i as usize * std::mem::size_of::<RefBits>()
}

pub(crate) const fn entry_offset(len: u32, domain: u32, i: u32) -> usize {
    std::mem::size_of::<QueueHeader>()
        + len as usize * std::mem::size_of::<RefBits>()
        + (domain as usize * len as usize + i as usize) * std::mem::size_of::<Entry>()
}

/// Total segment size for a queue of `len` rows and `num_domains` columns.
pub(crate) const fn queue_segment_size(len: u32, num_domains: u32) -> usize {
    entry_offset(len, num_domains, 0)
}

/// Borrowed, bounds-checked view over a mapped queue segment.
///
/// Pointers are re-derived from the mapping on every operation, so a remap
/// (after another process grew the queue) invalidates nothing.
pub(crate) struct QueueView<'a> {
    base: *mut u8,
    map_len: usize,
    _seg: PhantomData<&'a SharedMemorySegment>,
}

impl<'a> QueueView<'a> {
    pub fn new(seg: &'a SharedMemorySegment) -> Self {
        debug_assert!(seg.len() >= std::mem::size_of::<QueueHeader>());
        Self {
            base: seg.as_ptr(),
            map_len: seg.len(),
            _seg: PhantomData,
        }
    }

    pub fn header(&self) -> &'a QueueHeader {
        // SAFETY: construction asserted the mapping holds a header; all
        // mutable fields are atomics.
        unsafe { &*(self.base as *const QueueHeader) }
    }

    pub fn ref_bits(&self, len: u32, i: u32) -> &'a RefBits {
        let off = ref_bits_offset(i % len);
        debug_assert!(off + std::mem::size_of::<RefBits>() <= self.map_len);
        // SAFETY: i is reduced modulo the ring length and the mapping covers
        // queue_segment_size(len, num_domains) >= the ref-bits array.
        unsafe { &*(self.base.add(off) as *const RefBits) }
    }

    /// Read one entry cell. Only meaningful under the row's spin lock.
    pub fn entry(&self, len: u32, domain: u32, i: u32) -> Entry {
        let off = entry_offset(len, domain, i % len);
        debug_assert!(off + std::mem::size_of::<Entry>() <= self.map_len);
        // SAFETY: offset bounds hold per queue_segment_size; the row lock
        // serializes access to the cell.
        unsafe { std::ptr::read(self.base.add(off) as *const Entry) }
    }

    /// Write one entry cell. Only valid under the row's spin lock.
    pub fn set_entry(&self, len: u32, domain: u32, i: u32, e: Entry) {
        let off = entry_offset(len, domain, i % len);
        debug_assert!(off + std::mem::size_of::<Entry>() <= self.map_len);
        // SAFETY: as in `entry`.
        unsafe { std::ptr::write(self.base.add(off) as *mut Entry, e) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_wire_format() {
        // header | len ref-bits records | column-major entries
        assert_eq!(ref_bits_offset(0), 152);
        assert_eq!(ref_bits_offset(3), 152 + 36);
        let len = 8;
        assert_eq!(entry_offset(len, 0, 0), 152 + 8 * 12);
        assert_eq!(
            entry_offset(len, 2, 5),
            152 + 8 * 12 + (2 * 8 + 5) * 12,
            "column-major"
        );
        assert_eq!(queue_segment_size(len, 3), 152 + 8 * 12 + 3 * 8 * 12);
    }

    #[test]
    fn entry_is_pod_like() {
        let e = Entry {
            alloc_shmem_id: 1,
            offset: 64,
            len: 8,
        };
        let e2 = e;
        assert_eq!(e, e2);
        assert_eq!(Entry::default().alloc_shmem_id, 0);
    }
}
