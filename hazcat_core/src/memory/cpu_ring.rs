//! CPU ring allocator: fixed-stride ring whose items live in host shared
//! memory, directly inside the allocator's segment.

use crate::error::{HazcatError, HazcatResult};
use crate::memory::allocator::{
    create_alloc_segment, AllocStrategy, Allocator, AllocatorHeader, Backing, DeviceType,
};
use crate::memory::ring::{data_offset_for, init_ring, RingState};

/// Shared layout of a CPU ring segment. The common header sits at offset 0
/// in every variant; the refcount column and item bytes follow.
#[repr(C)]
pub struct CpuRingLayout {
    pub header: AllocatorHeader,
    pub ring: RingState,
}

const _: () = assert!(std::mem::size_of::<CpuRingLayout>() == 36);

/// Largest total segment we will create (1 GiB); guards size arithmetic.
const MAX_SEGMENT_BYTES: usize = 1 << 30;

pub(crate) fn create_cpu_ring(item_size: usize, ring_size: usize) -> HazcatResult<Allocator> {
    if item_size == 0 || ring_size == 0 {
        return Err(HazcatError::invalid_argument(
            "ring allocator needs non-zero item_size and ring_size",
        ));
    }
    if item_size > u32::MAX as usize || ring_size > u32::MAX as usize {
        return Err(HazcatError::invalid_argument(
            "item_size and ring_size must fit in 32 bits",
        ));
    }

    let data_offset = data_offset_for(std::mem::size_of::<CpuRingLayout>(), ring_size as u32);
    let data_bytes = item_size
        .checked_mul(ring_size)
        .filter(|b| b + (data_offset as usize) <= MAX_SEGMENT_BYTES)
        .ok_or_else(|| {
            HazcatError::invalid_argument(format!(
                "ring of {ring_size} x {item_size} bytes exceeds segment limit"
            ))
        })?;
    let total = data_offset as usize + data_bytes;

    let (id, seg) = create_alloc_segment(total)?;

    // SAFETY: the segment was just created, zero-filled and is not yet
    // visible to peers; the layout struct fits (total >= data_offset >
    // size_of::<CpuRingLayout>() + refcount column).
    unsafe {
        let layout = seg.as_ptr() as *mut CpuRingLayout;
        (*layout).header = AllocatorHeader {
            shmem_id: id,
            strategy: AllocStrategy::Ring as u32,
            device_type: DeviceType::Cpu as u16,
            device_number: 0,
        };
        init_ring(
            &mut (*layout).ring,
            item_size as u32,
            ring_size as u32,
            data_offset,
        );
    }

    log::debug!(
        "created CPU ring allocator {:#010x}: {} x {} bytes",
        id,
        ring_size,
        item_size
    );

    Ok(Allocator::from_parts(seg, Backing::Host))
}

#[cfg(test)]
mod tests {
    use crate::memory::allocator::{AllocStrategy, Allocator, DeviceType};

    #[test]
    fn creation_echoes_parameters() {
        let alloc = Allocator::cpu_ring(6, 30).unwrap();
        assert_eq!(alloc.strategy(), AllocStrategy::Ring);
        assert_eq!(alloc.device_type(), DeviceType::Cpu);
        assert_eq!(alloc.device_number(), 0);
        assert_eq!(alloc.count(), 0);
        assert_eq!(alloc.rear_it(), 0);
        assert_eq!(alloc.item_size(), 6);
        assert_eq!(alloc.ring_size(), 30);
    }

    #[test]
    fn rejects_zero_sizes() {
        assert!(Allocator::cpu_ring(0, 4).is_err());
        assert!(Allocator::cpu_ring(8, 0).is_err());
    }
}
