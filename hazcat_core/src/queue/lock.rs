//! Locking for the shared message queue.
//!
//! Two layers (the allocators bring their own third):
//! - a per-row spin lock in `RefBits::lock`, held for the tuple
//!   `(ref bits, entry row)` during publish and take
//! - an advisory `fcntl` lock on the queue's backing file: shared for
//!   data-plane operations, exclusive for structural changes
//!   (register/unregister/resize)
//!
//! `fcntl` locks are per-process, so same-process exclusion comes from the
//! queue node's `RwLock` instead; the kernel lock only arbitrates between
//! processes. Same-process data-plane operations share one kernel lock
//! through a counter - the first acquires it, the last releases it - which
//! also sidesteps fcntl's release-on-any-unlock semantics.

use std::fs::File;
use std::os::unix::io::AsRawFd;

use parking_lot::Mutex;

use crate::error::{HazcatError, HazcatResult};

pub(crate) use crate::memory::ring::{spin_lock, SpinGuard};

fn fcntl_set(file: &File, lock_type: i32) -> HazcatResult<()> {
    // SAFETY: zeroed flock is a valid initial value; all fields are set
    // below. l_len = 0 locks the whole file.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = lock_type as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = 0;
    fl.l_len = 0;

    // SAFETY: the fd is valid for the lifetime of `file`; F_SETLKW blocks
    // until the lock is granted.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLKW, &fl) };
    if rc == -1 {
        return Err(HazcatError::lock_failure_os("fcntl(F_SETLKW) failed"));
    }
    Ok(())
}

fn fcntl_unlock(file: &File) {
    // SAFETY: as in fcntl_set.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = libc::F_UNLCK as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;

    // SAFETY: fd valid; unlock never blocks.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &fl) };
    if rc == -1 {
        log::warn!(
            "couldn't release advisory file lock: {}",
            std::io::Error::last_os_error()
        );
    }
}

/// Exclusive advisory lock for structural queue changes.
///
/// Owns a duplicated fd so the guard's lifetime is self-contained; dropping
/// it both unlocks and closes the duplicate. Closing any fd strips all of
/// this process's fcntl locks on the file, so the guard must be dropped
/// while the caller still holds the node's write lock (no reader can be
/// mid-operation with a shared lock).
pub(crate) struct ExclusiveFileLock {
    file: File,
}

impl ExclusiveFileLock {
    pub fn acquire(file: &File) -> HazcatResult<Self> {
        let dup = file.try_clone()?;
        fcntl_set(&dup, libc::F_WRLCK as i32)?;
        Ok(Self { file: dup })
    }
}

impl Drop for ExclusiveFileLock {
    fn drop(&mut self) {
        fcntl_unlock(&self.file);
    }
}

/// Shared advisory lock for publish/take, reference-counted per process.
pub(crate) struct SharedFileLock<'a> {
    count: &'a Mutex<u32>,
    file: &'a File,
}

impl<'a> SharedFileLock<'a> {
    pub fn acquire(count: &'a Mutex<u32>, file: &'a File) -> HazcatResult<Self> {
        let mut c = count.lock();
        if *c == 0 {
            fcntl_set(file, libc::F_RDLCK as i32)?;
        }
        *c += 1;
        Ok(Self { count, file })
    }
}

impl Drop for SharedFileLock<'_> {
    fn drop(&mut self) {
        let mut c = self.count.lock();
        *c -= 1;
        if *c == 0 {
            fcntl_unlock(self.file);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_lock_is_counted() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("hazcat_lock_test_{}", std::process::id()));
        // Read locks need a readable fd
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        let count = Mutex::new(0);

        {
            let _a = SharedFileLock::acquire(&count, &file).unwrap();
            assert_eq!(*count.lock(), 1);
            {
                let _b = SharedFileLock::acquire(&count, &file).unwrap();
                assert_eq!(*count.lock(), 2);
            }
            assert_eq!(*count.lock(), 1);
        }
        assert_eq!(*count.lock(), 0);

        // Exclusive acquisition still works afterwards (same process never
        // self-deadlocks on fcntl locks).
        let _x = ExclusiveFileLock::acquire(&file).unwrap();
        let _ = std::fs::remove_file(&path);
    }
}
