//! Shared memory segment primitive.
//!
//! Every cross-process structure in hazcat (allocator pools, message queues)
//! is backed by one file in the hazcat shm directory, mapped read/write into
//! each attached process. Segments are identified by a flat file name, so a
//! process-independent id can always be turned back into a mapping.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;

use memmap2::{MmapMut, MmapOptions};

use crate::error::{HazcatError, HazcatResult};
use crate::memory::platform::{segment_path, shm_base_dir, SHM_NAME_MAX};

/// A shared memory segment: one backing file plus its mapping in this process.
///
/// The creating process is the owner and removes the backing file when it
/// drops the segment; peers that attached keep their mappings valid (the
/// kernel keeps unlinked tmpfs files alive until the last mapping goes away).
#[derive(Debug)]
pub struct SharedMemorySegment {
    file: File,
    map: MmapMut,
    path: PathBuf,
    name: String,
    owner: bool,
}

impl SharedMemorySegment {
    /// Create a fresh segment of `size` bytes. Fails if the name is taken.
    pub fn create(name: &str, size: usize) -> HazcatResult<Self> {
        validate_name(name)?;
        if size == 0 {
            return Err(HazcatError::invalid_argument(
                "segment size must be non-zero",
            ));
        }

        let dir = shm_base_dir();
        std::fs::create_dir_all(&dir)?;
        let path = segment_path(name);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                HazcatError::shared_memory(format!("couldn't create segment '{name}': {e}"))
            })?;
        file.set_len(size as u64)?;

        // SAFETY: file is a valid open file whose size was set above; the
        // mapping length matches the file size.
        let mut map = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
        map.fill(0);

        log::debug!("created shm segment '{}' ({} bytes)", name, size);

        Ok(Self {
            file,
            map,
            path,
            name: name.to_string(),
            owner: true,
        })
    }

    /// Attach an existing segment at its current size.
    pub fn open(name: &str) -> HazcatResult<Self> {
        validate_name(name)?;
        let path = segment_path(name);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                HazcatError::shared_memory(format!("couldn't open segment '{name}': {e}"))
            })?;

        let size = file.metadata()?.len() as usize;
        if size == 0 {
            return Err(HazcatError::shared_memory(format!(
                "segment '{name}' exists but has zero size"
            )));
        }

        // SAFETY: file is a valid open file of `size` bytes.
        let map = unsafe { MmapOptions::new().len(size).map_mut(&file)? };

        log::debug!("attached shm segment '{}' ({} bytes)", name, size);

        Ok(Self {
            file,
            map,
            path,
            name: name.to_string(),
            owner: false,
        })
    }

    /// Open the backing file for a segment, creating it (empty) if absent.
    ///
    /// Used by the message queue, which must take the advisory file lock
    /// *before* deciding whether it is the first process on the topic.
    pub fn open_file(name: &str) -> HazcatResult<File> {
        validate_name(name)?;
        let dir = shm_base_dir();
        std::fs::create_dir_all(&dir)?;
        let path = segment_path(name);

        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| HazcatError::shared_memory(format!("couldn't open '{name}': {e}")))
    }

    /// Map a file obtained from [`open_file`](Self::open_file) at its
    /// current size. `owner` controls unlink-on-drop.
    pub fn from_file(file: File, name: &str, owner: bool) -> HazcatResult<Self> {
        let size = file.metadata()?.len() as usize;
        if size == 0 {
            return Err(HazcatError::shared_memory(format!(
                "segment '{name}' has zero size, cannot map"
            )));
        }

        // SAFETY: file is a valid open file of `size` bytes.
        let map = unsafe { MmapOptions::new().len(size).map_mut(&file)? };

        Ok(Self {
            file,
            map,
            path: segment_path(name),
            name: name.to_string(),
            owner,
        })
    }

    /// Grow the backing file and refresh the mapping.
    pub fn resize(&mut self, size: usize) -> HazcatResult<()> {
        self.file.set_len(size as u64)?;
        self.remap()
    }

    /// Refresh the mapping to the current file size (after another process
    /// grew the file). The base address may change; callers must re-derive
    /// any pointers.
    pub fn remap(&mut self) -> HazcatResult<()> {
        let size = self.stat()? as usize;
        if size == 0 {
            return Err(HazcatError::shared_memory(format!(
                "segment '{}' shrank to zero",
                self.name
            )));
        }
        // SAFETY: self.file is a valid open file of `size` bytes.
        self.map = unsafe { MmapOptions::new().len(size).map_mut(&self.file)? };
        Ok(())
    }

    /// Current size of the backing file in bytes.
    pub fn stat(&self) -> HazcatResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Remove a segment's backing file by name.
    pub fn unlink(name: &str) -> HazcatResult<()> {
        let path = segment_path(name);
        std::fs::remove_file(&path).map_err(|e| {
            HazcatError::shared_memory(format!("couldn't unlink segment '{name}': {e}"))
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.map.as_ptr() as *mut u8
    }

    /// Length of the current mapping in bytes.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    /// The backing file, exposed for advisory fcntl locks.
    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle created the segment (responsible for cleanup).
    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

impl Drop for SharedMemorySegment {
    fn drop(&mut self) {
        if self.owner && self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                log::warn!("failed to unlink shm segment '{}': {}", self.name, e);
            }
        }
    }
}

// SAFETY: SharedMemorySegment is OS-level shared memory with no thread-local
// state; concurrent access is coordinated by atomics and advisory locks at
// the allocator/queue layer.
unsafe impl Send for SharedMemorySegment {}
unsafe impl Sync for SharedMemorySegment {}

fn validate_name(name: &str) -> HazcatResult<()> {
    if name.is_empty() || name.len() > SHM_NAME_MAX {
        return Err(HazcatError::invalid_argument(format!(
            "segment name '{}' must be 1..={} bytes",
            name, SHM_NAME_MAX
        )));
    }
    if name.contains('/') {
        return Err(HazcatError::invalid_argument(format!(
            "segment name '{name}' may not contain '/'"
        )));
    }
    Ok(())
}
