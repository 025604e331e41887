//! Shared memory allocators for hazcat.
//!
//! Each memory domain (host RAM, CUDA device memory) gets its own family of
//! shared-memory-backed allocators, addressable by every cooperating process
//! through a portable segment id. Messages never cross process boundaries as
//! pointers - only as `(allocator id, byte offset, length)` triples resolved
//! through the per-process [`registry`].

pub(crate) mod platform;
pub mod shm;

pub mod allocator;
pub mod cpu_ring;
pub mod cuda_ffi;
pub mod cuda_ring;
pub mod registry;
pub(crate) mod ring;

pub use allocator::{AllocStrategy, Allocator, AllocatorHeader, DeviceType, DomainId};
pub use platform::shm_base_dir;
pub use registry::AllocatorRegistry;
pub use shm::SharedMemorySegment;
