//! Minimal CUDA bindings for device ring allocators.
//!
//! Hand-crafted declarations against the CUDA runtime (allocation, copies,
//! IPC handles) plus the one driver-API entry point needed to discover the
//! device allocation granularity. No external CUDA crates; when the `cuda`
//! feature is off every call returns [`CudaError::NotSupported`] so the rest
//! of the crate compiles and runs CPU-only.
//!
//! CUDA IPC flow between processes on one host:
//! 1. the owner allocates device memory with `cudaMalloc`
//! 2. the owner exports a 64-byte handle with `cudaIpcGetMemHandle`
//! 3. the handle travels through the allocator's host-shared segment
//! 4. peers import it with `cudaIpcOpenMemHandle` and see the same device
//!    memory

use std::ffi::c_void;

/// CUDA IPC handle size (64 bytes, defined by NVIDIA)
pub const CUDA_IPC_HANDLE_SIZE: usize = 64;

/// CUDA error codes (runtime API numbering; driver results are mapped in)
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CudaError {
    InvalidValue = 1,
    MemoryAllocation = 2,
    InitializationError = 3,
    InvalidDevice = 10,
    NotSupported = 71,
    InvalidHandle = 400,
    Unknown = 999,
}

impl CudaError {
    fn from_code(code: i32) -> Self {
        match code {
            1 => CudaError::InvalidValue,
            2 => CudaError::MemoryAllocation,
            3 => CudaError::InitializationError,
            10 => CudaError::InvalidDevice,
            71 => CudaError::NotSupported,
            400 => CudaError::InvalidHandle,
            _ => CudaError::Unknown,
        }
    }
}

impl std::fmt::Display for CudaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            CudaError::InvalidValue => "invalid value",
            CudaError::MemoryAllocation => "memory allocation failed",
            CudaError::InitializationError => "initialization error",
            CudaError::InvalidDevice => "invalid device",
            CudaError::NotSupported => "operation not supported",
            CudaError::InvalidHandle => "invalid IPC handle",
            CudaError::Unknown => "unknown error",
        };
        write!(f, "CUDA: {}", msg)
    }
}

impl std::error::Error for CudaError {}

/// Result type for CUDA operations
pub type CudaResult<T> = Result<T, CudaError>;

/// CUDA IPC memory handle - 64 bytes of opaque data
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CudaIpcMemHandle {
    pub reserved: [u8; CUDA_IPC_HANDLE_SIZE],
}

impl Default for CudaIpcMemHandle {
    fn default() -> Self {
        Self {
            reserved: [0u8; CUDA_IPC_HANDLE_SIZE],
        }
    }
}

impl std::fmt::Debug for CudaIpcMemHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CudaIpcMemHandle({:02x?}...)", &self.reserved[..8])
    }
}

/// CUDA memory copy direction
#[repr(i32)]
#[derive(Debug, Clone, Copy)]
pub enum CudaMemcpyKind {
    HostToDevice = 1,
    DeviceToHost = 2,
    DeviceToDevice = 3,
}

#[cfg(feature = "cuda")]
mod ffi {
    use super::*;

    // --- Driver API types for cuMemGetAllocationGranularity ---

    pub const CU_MEM_ALLOCATION_TYPE_PINNED: i32 = 1;
    pub const CU_MEM_LOCATION_TYPE_DEVICE: i32 = 1;
    pub const CU_MEM_HANDLE_TYPE_POSIX_FILE_DESCRIPTOR: i32 = 1;
    pub const CU_MEM_ALLOC_GRANULARITY_MINIMUM: i32 = 0;

    #[repr(C)]
    pub struct CuMemLocation {
        pub location_type: i32,
        pub id: i32,
    }

    #[repr(C)]
    pub struct CuMemAllocationProp {
        pub alloc_type: i32,
        pub requested_handle_types: i32,
        pub location: CuMemLocation,
        pub win32_handle_meta_data: *mut c_void,
        pub alloc_flags: [u8; 8],
    }

    extern "C" {
        // Runtime API - linked against libcudart
        pub fn cudaGetDeviceCount(count: *mut i32) -> i32;
        pub fn cudaSetDevice(device: i32) -> i32;
        pub fn cudaMalloc(dev_ptr: *mut *mut c_void, size: usize) -> i32;
        pub fn cudaFree(dev_ptr: *mut c_void) -> i32;
        pub fn cudaMemcpy(dst: *mut c_void, src: *const c_void, count: usize, kind: i32) -> i32;
        pub fn cudaIpcGetMemHandle(handle: *mut CudaIpcMemHandle, dev_ptr: *mut c_void) -> i32;
        pub fn cudaIpcOpenMemHandle(
            dev_ptr: *mut *mut c_void,
            handle: CudaIpcMemHandle,
            flags: u32,
        ) -> i32;
        pub fn cudaIpcCloseMemHandle(dev_ptr: *mut c_void) -> i32;

        // Driver API - linked against libcuda
        pub fn cuInit(flags: u32) -> i32;
        pub fn cuMemGetAllocationGranularity(
            granularity: *mut usize,
            prop: *const CuMemAllocationProp,
            option: i32,
        ) -> i32;
    }

    /// cudaIpcMemLazyEnablePeerAccess
    pub const IPC_OPEN_FLAGS: u32 = 0x1;
}

#[cfg(feature = "cuda")]
fn check(code: i32) -> CudaResult<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(CudaError::from_code(code))
    }
}

/// Check if CUDA is available at runtime
#[cfg(feature = "cuda")]
pub fn cuda_available() -> bool {
    let mut count: i32 = 0;
    // SAFETY: cudaGetDeviceCount writes into a valid i32.
    unsafe { ffi::cudaGetDeviceCount(&mut count) == 0 && count > 0 }
}

#[cfg(not(feature = "cuda"))]
pub fn cuda_available() -> bool {
    false
}

/// Select the current CUDA device for this thread
#[cfg(feature = "cuda")]
pub fn set_device(device: i32) -> CudaResult<()> {
    // SAFETY: plain FFI call with a scalar argument.
    check(unsafe { ffi::cudaSetDevice(device) })
}

#[cfg(not(feature = "cuda"))]
pub fn set_device(_device: i32) -> CudaResult<()> {
    Err(CudaError::NotSupported)
}

/// Allocate device memory
#[cfg(feature = "cuda")]
pub fn malloc(size: usize) -> CudaResult<*mut c_void> {
    let mut ptr: *mut c_void = std::ptr::null_mut();
    // SAFETY: cudaMalloc writes a device pointer into a valid out-param.
    check(unsafe { ffi::cudaMalloc(&mut ptr, size) })?;
    Ok(ptr)
}

#[cfg(not(feature = "cuda"))]
pub fn malloc(_size: usize) -> CudaResult<*mut c_void> {
    Err(CudaError::NotSupported)
}

/// Free device memory
#[cfg(feature = "cuda")]
pub fn free(ptr: *mut c_void) -> CudaResult<()> {
    // SAFETY: ptr came from cudaMalloc.
    check(unsafe { ffi::cudaFree(ptr) })
}

#[cfg(not(feature = "cuda"))]
pub fn free(_ptr: *mut c_void) -> CudaResult<()> {
    Err(CudaError::NotSupported)
}

/// Copy between host and device memory
#[cfg(feature = "cuda")]
pub fn memcpy(
    dst: *mut c_void,
    src: *const c_void,
    size: usize,
    kind: CudaMemcpyKind,
) -> CudaResult<()> {
    // SAFETY: caller guarantees dst/src are valid for `size` bytes in the
    // address spaces implied by `kind`.
    check(unsafe { ffi::cudaMemcpy(dst, src, size, kind as i32) })
}

#[cfg(not(feature = "cuda"))]
pub fn memcpy(
    _dst: *mut c_void,
    _src: *const c_void,
    _size: usize,
    _kind: CudaMemcpyKind,
) -> CudaResult<()> {
    Err(CudaError::NotSupported)
}

/// Export an IPC handle for device memory allocated in this process
#[cfg(feature = "cuda")]
pub fn ipc_get_mem_handle(dev_ptr: *mut c_void) -> CudaResult<CudaIpcMemHandle> {
    let mut handle = CudaIpcMemHandle::default();
    // SAFETY: handle is a valid out-param; dev_ptr came from cudaMalloc.
    check(unsafe { ffi::cudaIpcGetMemHandle(&mut handle, dev_ptr) })?;
    Ok(handle)
}

#[cfg(not(feature = "cuda"))]
pub fn ipc_get_mem_handle(_dev_ptr: *mut c_void) -> CudaResult<CudaIpcMemHandle> {
    Err(CudaError::NotSupported)
}

/// Import another process's device allocation
#[cfg(feature = "cuda")]
pub fn ipc_open_mem_handle(handle: CudaIpcMemHandle) -> CudaResult<*mut c_void> {
    let mut ptr: *mut c_void = std::ptr::null_mut();
    // SAFETY: ptr is a valid out-param; the handle is a plain 64-byte token.
    check(unsafe { ffi::cudaIpcOpenMemHandle(&mut ptr, handle, ffi::IPC_OPEN_FLAGS) })?;
    Ok(ptr)
}

#[cfg(not(feature = "cuda"))]
pub fn ipc_open_mem_handle(_handle: CudaIpcMemHandle) -> CudaResult<*mut c_void> {
    Err(CudaError::NotSupported)
}

/// Release an imported IPC mapping (peers only; the owner calls [`free`])
#[cfg(feature = "cuda")]
pub fn ipc_close_mem_handle(dev_ptr: *mut c_void) -> CudaResult<()> {
    // SAFETY: dev_ptr came from cudaIpcOpenMemHandle in this process.
    check(unsafe { ffi::cudaIpcCloseMemHandle(dev_ptr) })
}

#[cfg(not(feature = "cuda"))]
pub fn ipc_close_mem_handle(_dev_ptr: *mut c_void) -> CudaResult<()> {
    Err(CudaError::NotSupported)
}

/// Minimum allocation granularity for shareable device memory on `device`.
///
/// Ring reservations are rounded up to a multiple of this, which may enlarge
/// `ring_size` beyond what the caller requested.
#[cfg(feature = "cuda")]
pub fn allocation_granularity(device: i32) -> CudaResult<usize> {
    // SAFETY: cuInit is idempotent; flags must be zero.
    check(unsafe { ffi::cuInit(0) })?;

    let prop = ffi::CuMemAllocationProp {
        alloc_type: ffi::CU_MEM_ALLOCATION_TYPE_PINNED,
        requested_handle_types: ffi::CU_MEM_HANDLE_TYPE_POSIX_FILE_DESCRIPTOR,
        location: ffi::CuMemLocation {
            location_type: ffi::CU_MEM_LOCATION_TYPE_DEVICE,
            id: device,
        },
        win32_handle_meta_data: std::ptr::null_mut(),
        alloc_flags: [0; 8],
    };

    let mut gran: usize = 0;
    // SAFETY: gran is a valid out-param, prop is fully initialized above.
    check(unsafe {
        ffi::cuMemGetAllocationGranularity(&mut gran, &prop, ffi::CU_MEM_ALLOC_GRANULARITY_MINIMUM)
    })?;
    Ok(gran)
}

#[cfg(not(feature = "cuda"))]
pub fn allocation_granularity(_device: i32) -> CudaResult<usize> {
    Err(CudaError::NotSupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipc_handle_is_64_bytes() {
        assert_eq!(std::mem::size_of::<CudaIpcMemHandle>(), 64);
    }

    #[test]
    fn error_display() {
        assert_eq!(
            format!("{}", CudaError::MemoryAllocation),
            "CUDA: memory allocation failed"
        );
    }

    #[test]
    #[cfg(not(feature = "cuda"))]
    fn stubs_report_not_supported() {
        assert!(!cuda_available());
        assert_eq!(malloc(16).unwrap_err(), CudaError::NotSupported);
        assert_eq!(
            allocation_granularity(0).unwrap_err(),
            CudaError::NotSupported
        );
    }
}
