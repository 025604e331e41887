//! Allocator header, memory domains and the variant dispatch handle.
//!
//! Every allocator segment begins with the same [`AllocatorHeader`] so that a
//! peer process can attach from a bare segment id and select the right
//! implementation from the `(strategy, device_type)` tags alone. All
//! cross-process references to allocations are 32-bit byte offsets relative
//! to that header; `pointer = base + offset` is re-derived per process.

use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{HazcatError, HazcatResult};
use crate::memory::cpu_ring::{create_cpu_ring, CpuRingLayout};
use crate::memory::cuda_ffi::{self, CudaMemcpyKind};
use crate::memory::cuda_ring::{create_cuda_ring, open_cuda_backing, CudaRingLayout};
use crate::memory::platform::segment_path;
use crate::memory::ring::{RingOps, RingState};
use crate::memory::shm::SharedMemorySegment;

/// Common prefix of every allocator segment, at offset 0.
///
/// The layout is bit-identical in all variants (verified by a structural
/// test); `shmem_id` is self-referential so a mapped header is enough to
/// re-derive its own segment name.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AllocatorHeader {
    pub shmem_id: u32,
    pub strategy: u32,
    pub device_type: u16,
    pub device_number: u16,
}

const _: () = assert!(std::mem::size_of::<AllocatorHeader>() == 12);

/// Allocation strategy tag stored in the shared header.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStrategy {
    Ring = 1,
}

impl AllocStrategy {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(AllocStrategy::Ring),
            _ => None,
        }
    }
}

/// Memory domain kind stored in the shared header.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Cpu = 0,
    Cuda = 1,
}

impl DeviceType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(DeviceType::Cpu),
            1 => Some(DeviceType::Cuda),
            _ => None,
        }
    }
}

/// One coherent address space: `(device_type, device_number)` packed into an
/// opaque 32-bit equality key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DomainId(u32);

impl DomainId {
    pub const CPU: DomainId = DomainId::new(DeviceType::Cpu, 0);

    pub const fn new(device_type: DeviceType, device_number: u16) -> Self {
        DomainId(((device_type as u32) << 16) | device_number as u32)
    }

    pub const fn from_raw(raw: u32) -> Self {
        DomainId(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn device_type(self) -> Option<DeviceType> {
        DeviceType::from_u16((self.0 >> 16) as u16)
    }

    pub fn device_number(self) -> u16 {
        self.0 as u16
    }
}

/// Process-local backing of an attached allocator.
pub(crate) enum Backing {
    Host,
    Cuda(CudaBacking),
}

pub(crate) struct CudaBacking {
    pub dev_ptr: *mut c_void,
    pub dev_len: usize,
    pub owner: bool,
}

/// A shared-memory-backed, fixed-stride pool, identified cross-process by a
/// segment id. One handle per process; operations dispatch on the
/// `(strategy, device_type)` tags in the mapped header.
pub struct Allocator {
    seg: SharedMemorySegment,
    backing: Backing,
}

// SAFETY: all shared mutation goes through atomics guarded by the ring spin
// word; the device pointer is only ever passed to cudaMemcpy/cudaFree, which
// are thread-safe.
unsafe impl Send for Allocator {}
unsafe impl Sync for Allocator {}

/// Segment file name for an allocator id; pure so any process computes it.
pub(crate) fn alloc_segment_name(id: u32) -> String {
    format!("alloc_{id:08x}")
}

static NEXT_SEGMENT_ID: AtomicU32 = AtomicU32::new(1);

fn next_segment_id() -> u32 {
    let n = NEXT_SEGMENT_ID.fetch_add(1, Ordering::Relaxed);
    let id = (std::process::id() << 16) ^ n.wrapping_mul(0x9E37_79B9);
    if id == 0 {
        0x5EED
    } else {
        id
    }
}

/// Create a fresh, zeroed allocator segment under a free id.
pub(crate) fn create_alloc_segment(total: usize) -> HazcatResult<(u32, SharedMemorySegment)> {
    for _ in 0..16 {
        let id = next_segment_id();
        let name = alloc_segment_name(id);
        match SharedMemorySegment::create(&name, total) {
            Ok(seg) => return Ok((id, seg)),
            // Lost an id race; pick another
            Err(_) if segment_path(&name).exists() => continue,
            Err(e) => return Err(e),
        }
    }
    Err(HazcatError::shared_memory(
        "couldn't find a free allocator segment id",
    ))
}

impl Allocator {
    /// Create a CPU ring allocator: `ring_size` fixed-stride items of
    /// `item_size` bytes in host shared memory.
    pub fn cpu_ring(item_size: usize, ring_size: usize) -> HazcatResult<Arc<Allocator>> {
        create_cpu_ring(item_size, ring_size).map(Arc::new)
    }

    /// Create a CUDA ring allocator on `device`. `ring_size` may be rounded
    /// up to satisfy the device allocation granularity.
    pub fn cuda_ring(
        item_size: usize,
        ring_size: usize,
        device: i32,
    ) -> HazcatResult<Arc<Allocator>> {
        create_cuda_ring(item_size, ring_size, device).map(Arc::new)
    }

    pub(crate) fn from_parts(seg: SharedMemorySegment, backing: Backing) -> Allocator {
        Allocator { seg, backing }
    }

    /// Attach an allocator created by another process from its segment id.
    pub fn attach(shmem_id: u32) -> HazcatResult<Allocator> {
        let name = alloc_segment_name(shmem_id);
        let seg = SharedMemorySegment::open(&name)?;
        if seg.len() < std::mem::size_of::<CpuRingLayout>() {
            return Err(HazcatError::shared_memory(format!(
                "segment '{name}' too small for an allocator header"
            )));
        }

        // SAFETY: length checked above; the creator fully initialized the
        // header before publishing the id.
        let header = unsafe { *(seg.as_ptr() as *const AllocatorHeader) };
        if header.shmem_id != shmem_id {
            return Err(HazcatError::shared_memory(format!(
                "segment '{name}' header id {:#010x} doesn't match",
                header.shmem_id
            )));
        }
        AllocStrategy::from_u32(header.strategy).ok_or_else(|| {
            HazcatError::shared_memory(format!(
                "segment '{name}' carries unknown strategy tag {}",
                header.strategy
            ))
        })?;

        let backing = match DeviceType::from_u16(header.device_type) {
            Some(DeviceType::Cpu) => Backing::Host,
            Some(DeviceType::Cuda) => open_cuda_backing(&seg)?,
            None => {
                return Err(HazcatError::shared_memory(format!(
                    "segment '{name}' carries unknown device tag {}",
                    header.device_type
                )))
            }
        };

        log::debug!("attached allocator {:#010x} ('{}')", shmem_id, name);
        Ok(Allocator { seg, backing })
    }

    // --- header accessors -------------------------------------------------

    fn header(&self) -> &AllocatorHeader {
        // SAFETY: every constructor verified the segment holds a header.
        unsafe { &*(self.seg.as_ptr() as *const AllocatorHeader) }
    }

    fn ring(&self) -> &RingState {
        // Both ring layouts place RingState directly after the header;
        // asserted structurally in tests.
        // SAFETY: constructors verified the segment holds the full layout.
        unsafe { &(*(self.seg.as_ptr() as *const CpuRingLayout)).ring }
    }

    fn ring_ops(&self) -> RingOps<'_> {
        let layout_size = match self.device_type() {
            DeviceType::Cpu => std::mem::size_of::<CpuRingLayout>(),
            DeviceType::Cuda => std::mem::size_of::<CudaRingLayout>(),
        };
        let state = self.ring();
        // SAFETY: the refcount column of ring_size words directly follows the
        // layout struct; both were sized into the segment at creation.
        let refs = unsafe {
            std::slice::from_raw_parts(
                self.seg.as_ptr().add(layout_size) as *const AtomicU32,
                state.ring_size as usize,
            )
        };
        RingOps { state, refs }
    }

    pub fn shmem_id(&self) -> u32 {
        self.header().shmem_id
    }

    pub fn strategy(&self) -> AllocStrategy {
        AllocStrategy::from_u32(self.header().strategy).expect("validated at attach")
    }

    pub fn device_type(&self) -> DeviceType {
        DeviceType::from_u16(self.header().device_type).expect("validated at attach")
    }

    pub fn device_number(&self) -> u16 {
        self.header().device_number
    }

    pub fn domain(&self) -> DomainId {
        DomainId::new(self.device_type(), self.device_number())
    }

    pub fn item_size(&self) -> usize {
        self.ring().item_size as usize
    }

    pub fn ring_size(&self) -> usize {
        self.ring().ring_size as usize
    }

    /// Live allocations currently in the ring.
    pub fn count(&self) -> u32 {
        self.ring().count.load(Ordering::Relaxed)
    }

    /// Index of the oldest live item.
    pub fn rear_it(&self) -> u32 {
        self.ring().rear_it.load(Ordering::Relaxed)
    }

    /// Offset of the first item slot; all allocation offsets are
    /// `data_offset + slot * item_size`.
    pub fn data_offset(&self) -> u32 {
        self.ring().data_offset
    }

    // --- capability set ---------------------------------------------------

    /// Claim a slot. `len` is ignored beyond a debug bound check (the stride
    /// is fixed); `None` means the ring is full, which is not an error.
    pub fn allocate(&self, len: usize) -> Option<u32> {
        self.ring_ops().allocate(len)
    }

    /// Drop one reference to an allocation, reclaiming slots when the rear
    /// run dies.
    pub fn deallocate(&self, offset: u32) {
        self.ring_ops().deallocate(offset)
    }

    /// Add a reference to a live allocation.
    pub fn share(&self, offset: u32) {
        self.ring_ops().share(offset)
    }

    fn check_range(&self, offset: u32, len: usize) -> HazcatResult<()> {
        let r = self.ring();
        let start = r.data_offset as usize;
        let end = start + r.ring_size as usize * r.item_size as usize;
        let off = offset as usize;
        if off < start || off.checked_add(len).map_or(true, |e| e > end) {
            return Err(HazcatError::invalid_argument(format!(
                "range {offset}+{len} outside allocator {:#010x} data region",
                self.shmem_id()
            )));
        }
        Ok(())
    }

    /// Host pointer for an offset. `None` for device-backed allocators.
    pub(crate) fn host_ptr(&self, offset: u32) -> Option<*mut u8> {
        match self.backing {
            // SAFETY: offsets are validated against the data region, which
            // lies inside the mapping for host allocators.
            Backing::Host => Some(unsafe { self.seg.as_ptr().add(offset as usize) }),
            Backing::Cuda(_) => None,
        }
    }

    fn dev_ptr(&self, offset: u32) -> Option<*mut c_void> {
        match &self.backing {
            Backing::Host => None,
            Backing::Cuda(c) => {
                let rel = offset as usize - self.ring().data_offset as usize;
                // SAFETY: rel < dev_len after check_range.
                Some(unsafe { (c.dev_ptr as *mut u8).add(rel) } as *mut c_void)
            }
        }
    }

    /// Copy host bytes into this allocator's domain at `dst_offset`.
    pub fn copy_to(&self, dst_offset: u32, src: &[u8]) -> HazcatResult<()> {
        self.check_range(dst_offset, src.len())?;
        match &self.backing {
            Backing::Host => {
                // SAFETY: destination range validated; src is a live slice.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        src.as_ptr(),
                        self.seg.as_ptr().add(dst_offset as usize),
                        src.len(),
                    );
                }
                Ok(())
            }
            Backing::Cuda(_) => cuda_ffi::memcpy(
                self.dev_ptr(dst_offset).expect("cuda backing"),
                src.as_ptr() as *const c_void,
                src.len(),
                CudaMemcpyKind::HostToDevice,
            )
            .map_err(|e| HazcatError::device(format!("host->device copy failed: {e}"))),
        }
    }

    /// Copy bytes from this allocator's domain at `src_offset` to host.
    pub fn copy_from(&self, src_offset: u32, dst: &mut [u8]) -> HazcatResult<()> {
        self.check_range(src_offset, dst.len())?;
        match &self.backing {
            Backing::Host => {
                // SAFETY: source range validated; dst is a live slice.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        self.seg.as_ptr().add(src_offset as usize),
                        dst.as_mut_ptr(),
                        dst.len(),
                    );
                }
                Ok(())
            }
            Backing::Cuda(_) => cuda_ffi::memcpy(
                dst.as_mut_ptr() as *mut c_void,
                self.dev_ptr(src_offset).expect("cuda backing"),
                dst.len(),
                CudaMemcpyKind::DeviceToHost,
            )
            .map_err(|e| HazcatError::device(format!("device->host copy failed: {e}"))),
        }
    }

    /// Peer-to-peer copy into this allocator. Device-to-device is used when
    /// both ends sit on the same physical device, otherwise the transfer is
    /// staged through host memory.
    pub fn copy(
        &self,
        dst_offset: u32,
        src: &Allocator,
        src_offset: u32,
        len: usize,
    ) -> HazcatResult<()> {
        self.check_range(dst_offset, len)?;
        src.check_range(src_offset, len)?;
        match (&self.backing, &src.backing) {
            (Backing::Host, Backing::Host) => {
                // SAFETY: both ranges validated; distinct segments, and a
                // same-segment copy of distinct live slots never overlaps.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        src.seg.as_ptr().add(src_offset as usize),
                        self.seg.as_ptr().add(dst_offset as usize),
                        len,
                    );
                }
                Ok(())
            }
            (Backing::Cuda(_), Backing::Host) => {
                // SAFETY: source range validated against the host mapping.
                let bytes = unsafe {
                    std::slice::from_raw_parts(src.seg.as_ptr().add(src_offset as usize), len)
                };
                self.copy_to(dst_offset, bytes)
            }
            (Backing::Host, Backing::Cuda(_)) => {
                // SAFETY: destination range validated against the host mapping.
                let bytes = unsafe {
                    std::slice::from_raw_parts_mut(self.seg.as_ptr().add(dst_offset as usize), len)
                };
                src.copy_from(src_offset, bytes)
            }
            (Backing::Cuda(_), Backing::Cuda(_)) => {
                if self.device_number() == src.device_number() {
                    cuda_ffi::memcpy(
                        self.dev_ptr(dst_offset).expect("cuda backing"),
                        src.dev_ptr(src_offset).expect("cuda backing") as *const c_void,
                        len,
                        CudaMemcpyKind::DeviceToDevice,
                    )
                    .map_err(|e| HazcatError::device(format!("device->device copy failed: {e}")))
                } else {
                    let mut staging = vec![0u8; len];
                    src.copy_from(src_offset, &mut staging)?;
                    self.copy_to(dst_offset, &staging)
                }
            }
        }
    }

    // --- pointer translation ---------------------------------------------

    /// Translate an offset to a process-local pointer: a host pointer for
    /// CPU allocators, a device pointer for device allocators.
    pub fn offset_to_ptr(&self, offset: u32) -> Option<*mut u8> {
        self.check_range(offset, 0).ok()?;
        match &self.backing {
            Backing::Host => self.host_ptr(offset),
            Backing::Cuda(_) => self.dev_ptr(offset).map(|p| p as *mut u8),
        }
    }

    /// Translate a pointer inside this allocator's data region back to its
    /// portable offset.
    pub fn ptr_to_offset(&self, ptr: *const u8) -> Option<u32> {
        let r = self.ring();
        let data_len = r.ring_size as usize * r.item_size as usize;
        // Device rings expose their data at dev_ptr; host rings inside the
        // mapping, data_offset bytes in. Either way `start` maps to offset
        // data_offset.
        let start = match &self.backing {
            Backing::Host => self.seg.as_ptr() as usize + r.data_offset as usize,
            Backing::Cuda(c) => c.dev_ptr as usize,
        };
        let p = ptr as usize;
        if p < start || p >= start + data_len {
            return None;
        }
        Some((p - start) as u32 + r.data_offset)
    }

    /// Whether a pointer falls inside this allocator's data region.
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.ptr_to_offset(ptr).is_some()
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        if let Backing::Cuda(c) = &self.backing {
            let res = if c.owner {
                cuda_ffi::free(c.dev_ptr)
            } else {
                cuda_ffi::ipc_close_mem_handle(c.dev_ptr)
            };
            if let Err(e) = res {
                log::warn!(
                    "failed to release device memory of allocator {:#010x}: {}",
                    self.shmem_id(),
                    e
                );
            }
        }
    }
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("shmem_id", &self.shmem_id())
            .field("domain", &self.domain())
            .field("item_size", &self.item_size())
            .field("ring_size", &self.ring_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_id_packs_type_and_ordinal() {
        let d = DomainId::new(DeviceType::Cuda, 3);
        assert_eq!(d.device_type(), Some(DeviceType::Cuda));
        assert_eq!(d.device_number(), 3);
        assert_ne!(d, DomainId::CPU);
        assert_eq!(DomainId::from_raw(d.raw()), d);
    }

    #[test]
    fn segment_ids_are_distinct_and_named() {
        let a = next_segment_id();
        let b = next_segment_id();
        assert_ne!(a, b);
        assert_eq!(alloc_segment_name(0x2a), "alloc_0000002a");
    }

    #[test]
    fn attach_sees_creators_ring() {
        let owner = Allocator::cpu_ring(8, 4).unwrap();
        let off = owner.allocate(8).unwrap();
        owner.copy_to(off, &7u64.to_le_bytes()).unwrap();

        let peer = Allocator::attach(owner.shmem_id()).unwrap();
        assert_eq!(peer.shmem_id(), owner.shmem_id());
        assert_eq!(peer.item_size(), 8);
        assert_eq!(peer.count(), 1);
        let mut buf = [0u8; 8];
        peer.copy_from(off, &mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 7);

        // Peer deallocation is visible to the owner
        peer.deallocate(off);
        assert_eq!(owner.count(), 0);
    }

    #[test]
    fn pointer_round_trip() {
        let alloc = Allocator::cpu_ring(16, 2).unwrap();
        let off = alloc.allocate(16).unwrap();
        let ptr = alloc.offset_to_ptr(off).unwrap();
        assert!(alloc.contains(ptr));
        assert_eq!(alloc.ptr_to_offset(ptr), Some(off));
        assert!(!alloc.contains(std::ptr::null()));
    }
}
