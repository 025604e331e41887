//! CUDA ring allocator: ring bookkeeping in host shared memory, item bytes
//! in device memory exported to peer processes via a CUDA IPC handle.
//!
//! Offsets handed out by a device ring continue the same offset space as CPU
//! rings (`data_offset + slot * item_size`); the device address for an offset
//! is `dev_base + (offset - data_offset)`. The host segment ends where the
//! item bytes would begin.

use std::ffi::c_void;

use crate::error::{HazcatError, HazcatResult};
use crate::memory::allocator::{
    create_alloc_segment, AllocStrategy, Allocator, AllocatorHeader, Backing, CudaBacking,
    DeviceType,
};
use crate::memory::cuda_ffi::{self, CudaIpcMemHandle, CUDA_IPC_HANDLE_SIZE};
use crate::memory::ring::{data_offset_for, init_ring, RingState};
use crate::memory::shm::SharedMemorySegment;

/// Shared layout of a CUDA ring segment. Header and ring state match the CPU
/// variant byte-for-byte; the IPC handle lets peers import the device bytes.
#[repr(C)]
pub struct CudaRingLayout {
    pub header: AllocatorHeader,
    pub ring: RingState,
    pub ipc_handle: [u8; CUDA_IPC_HANDLE_SIZE],
    pub granularity: u64,
    pub device_len: u64,
}

const _: () = assert!(std::mem::size_of::<CudaRingLayout>() == 120);

pub(crate) fn create_cuda_ring(
    item_size: usize,
    ring_size: usize,
    device: i32,
) -> HazcatResult<Allocator> {
    if item_size == 0 || ring_size == 0 {
        return Err(HazcatError::invalid_argument(
            "ring allocator needs non-zero item_size and ring_size",
        ));
    }
    if !cuda_ffi::cuda_available() {
        return Err(HazcatError::device("no CUDA device available"));
    }
    if device < 0 || device > u16::MAX as i32 {
        return Err(HazcatError::invalid_argument(format!(
            "CUDA device ordinal {device} out of range"
        )));
    }

    cuda_ffi::set_device(device)
        .map_err(|e| HazcatError::device(format!("couldn't select device {device}: {e}")))?;

    // The device reservation must be a granularity multiple; dividing it
    // back by the stride can only enlarge the ring.
    let granularity = cuda_ffi::allocation_granularity(device)
        .map_err(|e| HazcatError::device(format!("granularity query failed: {e}")))?;
    let requested_bytes = item_size * ring_size;
    let device_len = requested_bytes.div_ceil(granularity) * granularity;
    let ring_size = device_len / item_size;
    if ring_size > u32::MAX as usize {
        return Err(HazcatError::invalid_argument(
            "padded ring_size must fit in 32 bits",
        ));
    }

    let dev_ptr = cuda_ffi::malloc(device_len)
        .map_err(|e| HazcatError::device(format!("device allocation failed: {e}")))?;

    let handle = match cuda_ffi::ipc_get_mem_handle(dev_ptr) {
        Ok(h) => h,
        Err(e) => {
            let _ = cuda_ffi::free(dev_ptr);
            return Err(HazcatError::device(format!("IPC handle export failed: {e}")));
        }
    };

    let data_offset = data_offset_for(std::mem::size_of::<CudaRingLayout>(), ring_size as u32);
    let (id, seg) = match create_alloc_segment(data_offset as usize) {
        Ok(v) => v,
        Err(e) => {
            let _ = cuda_ffi::free(dev_ptr);
            return Err(e);
        }
    };

    // SAFETY: the segment was just created, zero-filled and is not yet
    // visible to peers; data_offset > size_of::<CudaRingLayout>().
    unsafe {
        let layout = seg.as_ptr() as *mut CudaRingLayout;
        (*layout).header = AllocatorHeader {
            shmem_id: id,
            strategy: AllocStrategy::Ring as u32,
            device_type: DeviceType::Cuda as u16,
            device_number: device as u16,
        };
        init_ring(
            &mut (*layout).ring,
            item_size as u32,
            ring_size as u32,
            data_offset,
        );
        (*layout).ipc_handle = handle.reserved;
        (*layout).granularity = granularity as u64;
        (*layout).device_len = device_len as u64;
    }

    log::debug!(
        "created CUDA ring allocator {:#010x} on device {}: {} x {} bytes ({} reserved)",
        id,
        device,
        ring_size,
        item_size,
        device_len
    );

    Ok(Allocator::from_parts(
        seg,
        Backing::Cuda(CudaBacking {
            dev_ptr,
            dev_len: device_len,
            owner: true,
        }),
    ))
}

/// Import the device backing of an already-mapped CUDA ring segment.
pub(crate) fn open_cuda_backing(seg: &SharedMemorySegment) -> HazcatResult<Backing> {
    if seg.len() < std::mem::size_of::<CudaRingLayout>() {
        return Err(HazcatError::shared_memory(format!(
            "segment '{}' too small for a CUDA ring",
            seg.name()
        )));
    }

    // SAFETY: length checked above; the creator fully initialized the layout
    // before the segment became reachable.
    let (handle, device, dev_len) = unsafe {
        let layout = &*(seg.as_ptr() as *const CudaRingLayout);
        (
            CudaIpcMemHandle {
                reserved: layout.ipc_handle,
            },
            layout.header.device_number as i32,
            layout.device_len as usize,
        )
    };

    cuda_ffi::set_device(device)
        .map_err(|e| HazcatError::device(format!("couldn't select device {device}: {e}")))?;
    let dev_ptr: *mut c_void = cuda_ffi::ipc_open_mem_handle(handle)
        .map_err(|e| HazcatError::device(format!("IPC handle import failed: {e}")))?;

    Ok(Backing::Cuda(CudaBacking {
        dev_ptr,
        dev_len,
        owner: false,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_places_header_first() {
        assert_eq!(std::mem::offset_of!(CudaRingLayout, header), 0);
    }

    #[test]
    fn padded_ring_never_shrinks() {
        // Same arithmetic create_cuda_ring applies, across awkward strides
        for gran in [4096usize, 2 << 20] {
            for (item, ring) in [(6, 30), (8, 3), (4 + gran / 4, 3)] {
                let device_len = (item * ring).div_ceil(gran) * gran;
                assert_eq!(device_len % gran, 0);
                assert!(device_len / item >= ring);
            }
        }
    }
}
