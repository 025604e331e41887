//! Ring allocator behavior, shared across variants.
//!
//! The structural test pins the common header layout: every allocator
//! variant must place `shmem_id`/`strategy`/`device_type`/`device_number`
//! at identical byte offsets, since peer processes select the dispatch
//! implementation from a bare mapped header.

use std::mem::offset_of;

use hazcat_core::memory::allocator::AllocatorHeader;
use hazcat_core::memory::cpu_ring::CpuRingLayout;
use hazcat_core::memory::cuda_ring::CudaRingLayout;
use hazcat_core::Allocator;

#[test]
fn header_layout_identical_across_variants() {
    // The common header leads both shared layouts
    assert_eq!(offset_of!(CpuRingLayout, header), 0);
    assert_eq!(offset_of!(CudaRingLayout, header), 0);
    // and the ring bookkeeping follows at the same offset
    assert_eq!(
        offset_of!(CpuRingLayout, ring),
        offset_of!(CudaRingLayout, ring)
    );

    // Field order inside the header is part of the wire format
    assert_eq!(offset_of!(AllocatorHeader, shmem_id), 0);
    assert_eq!(offset_of!(AllocatorHeader, strategy), 4);
    assert_eq!(offset_of!(AllocatorHeader, device_type), 8);
    assert_eq!(offset_of!(AllocatorHeader, device_number), 10);
}

#[test]
fn cpu_ring_fills_then_rejects() {
    let alloc = Allocator::cpu_ring(8, 3).unwrap();
    let h = alloc.data_offset();

    // Four allocations into three slots
    let a1 = alloc.allocate(0).unwrap();
    assert_eq!(a1, h);
    assert_eq!(alloc.count(), 1);
    assert_eq!(alloc.rear_it(), 0);

    let a2 = alloc.allocate(0).unwrap();
    assert_eq!(a2 - a1, 8);
    assert_eq!(alloc.count(), 2);
    assert_eq!(alloc.rear_it(), 0);

    let a3 = alloc.allocate(0).unwrap();
    assert_eq!(a3 - a1, 16);
    assert_eq!(alloc.count(), 3);
    assert_eq!(alloc.rear_it(), 0);

    assert_eq!(alloc.allocate(0), None, "full ring is a normal None");
    assert_eq!(alloc.count(), 3);
    assert_eq!(alloc.rear_it(), 0);
}

fn write_f32(alloc: &Allocator, offset: u32, v: f32) {
    alloc.copy_to(offset, &v.to_le_bytes()).unwrap();
}

fn read_f32(alloc: &Allocator, offset: u32) -> f32 {
    let mut buf = [0u8; 4];
    alloc.copy_from(offset, &mut buf).unwrap();
    f32::from_le_bytes(buf)
}

#[test]
fn cpu_ring_reuses_freed_slots_and_preserves_bytes() {
    let alloc = Allocator::cpu_ring(8, 3).unwrap();

    let a1 = alloc.allocate(0).unwrap();
    let a2 = alloc.allocate(0).unwrap();
    let a3 = alloc.allocate(0).unwrap();
    write_f32(&alloc, a1, 4.5);
    write_f32(&alloc, a2, 2.25);
    write_f32(&alloc, a3, 1.125);

    // Release the two oldest
    alloc.deallocate(a1);
    assert_eq!(alloc.count(), 2);
    assert_eq!(alloc.rear_it(), 1);
    alloc.deallocate(a2);
    assert_eq!(alloc.count(), 1);
    assert_eq!(alloc.rear_it(), 2);

    // Fresh allocations land on the freed slots
    let a5 = alloc.allocate(0).unwrap();
    assert_eq!(a5, a1);
    assert_eq!(alloc.count(), 2);
    assert_eq!(alloc.rear_it(), 2);
    let a6 = alloc.allocate(0).unwrap();
    assert_eq!(a6, a2);
    assert_eq!(alloc.count(), 3);
    assert_eq!(alloc.rear_it(), 2);

    // Bytes survive dealloc/realloc cycles, including the untouched slot
    assert_eq!(read_f32(&alloc, a5), 4.5);
    assert_eq!(read_f32(&alloc, a6), 2.25);
    assert_eq!(read_f32(&alloc, a3), 1.125);
}

#[test]
fn cpu_ring_conserves_slots_across_cycles() {
    let alloc = Allocator::cpu_ring(16, 5).unwrap();
    for _ in 0..20 {
        let offs: Vec<u32> = (0..5).map(|_| alloc.allocate(0).unwrap()).collect();
        assert_eq!(alloc.count(), 5);
        assert!(alloc.allocate(0).is_none());
        for o in offs {
            alloc.deallocate(o);
        }
        assert_eq!(alloc.count(), 0, "no leaked slots");
    }
}

#[test]
fn attached_peer_shares_ring_state() {
    let owner = Allocator::cpu_ring(8, 3).unwrap();
    let a1 = owner.allocate(0).unwrap();
    write_f32(&owner, a1, 4.5);

    let peer = Allocator::attach(owner.shmem_id()).unwrap();
    assert_eq!(peer.data_offset(), owner.data_offset());
    assert_eq!(read_f32(&peer, a1), 4.5);

    let a2 = peer.allocate(0).unwrap();
    assert_eq!(a2 - a1, 8, "peer allocates from the shared ring");
    assert_eq!(owner.count(), 2);
}

#[cfg(feature = "cuda")]
mod cuda {
    use super::*;
    use hazcat_core::memory::cuda_ffi;
    use hazcat_core::DeviceType;

    #[test]
    fn cuda_ring_creation_rounds_up() {
        let alloc = Allocator::cuda_ring(6, 30, 0).unwrap();
        assert_eq!(alloc.strategy(), hazcat_core::AllocStrategy::Ring);
        assert_eq!(alloc.device_type(), DeviceType::Cuda);
        assert_eq!(alloc.device_number(), 0);
        assert_eq!(alloc.count(), 0);
        assert_eq!(alloc.rear_it(), 0);
        assert_eq!(alloc.item_size(), 6);
        assert!(alloc.ring_size() >= 30, "granularity may only enlarge");
    }

    #[test]
    fn cuda_ring_round_trip_and_slot_reuse() {
        let gran = cuda_ffi::allocation_granularity(0).unwrap();
        let item_size = std::mem::size_of::<f32>() + gran / 4;
        let alloc = Allocator::cuda_ring(item_size, 3, 0).unwrap();

        let a1 = alloc.allocate(0).unwrap();
        let a2 = alloc.allocate(0).unwrap();
        let a3 = alloc.allocate(0).unwrap();
        assert_eq!((a2 - a1) as usize, item_size);
        assert_eq!((a3 - a1) as usize, 2 * item_size);

        write_f32(&alloc, a1, 4.5);
        write_f32(&alloc, a2, 2.25);
        write_f32(&alloc, a3, 1.125);
        assert_eq!(read_f32(&alloc, a1), 4.5);
        assert_eq!(read_f32(&alloc, a2), 2.25);
        assert_eq!(read_f32(&alloc, a3), 1.125);

        alloc.deallocate(a1);
        assert_eq!(alloc.count(), 2);
        assert_eq!(alloc.rear_it(), 1);
        alloc.deallocate(a2);
        assert_eq!(alloc.count(), 1);
        assert_eq!(alloc.rear_it(), 2);

        // Reallocated slots resolve to the original device pointers
        let a5 = alloc.allocate(0).unwrap();
        let a6 = alloc.allocate(0).unwrap();
        assert_eq!(a5, a1);
        assert_eq!(a6, a2);
        assert_eq!(alloc.offset_to_ptr(a5), alloc.offset_to_ptr(a1));

        // Old device bytes still readable after realloc
        assert_eq!(read_f32(&alloc, a5), 4.5);
        assert_eq!(read_f32(&alloc, a6), 2.25);
    }
}
