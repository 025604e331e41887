//! Per-process attachment of one topic queue.
//!
//! A [`QueueNode`] owns the mapped queue segment for a topic in this process.
//! Structural work (creation, domain columns, ring growth, endpoint counts)
//! runs under the node's write lock plus the exclusive advisory file lock;
//! publish and take run under the read lock plus the shared file lock and
//! re-derive all pointers from the current mapping, remapping first whenever
//! another process grew the file.

use std::fs::File;
use std::sync::atomic::Ordering;

use parking_lot::{Mutex, RwLock};

use crate::error::{HazcatError, HazcatResult};
use crate::memory::allocator::DomainId;
use crate::memory::platform::{segment_path, SHM_NAME_MAX};
use crate::memory::shm::SharedMemorySegment;
use crate::queue::layout::{
    entry_offset, queue_segment_size, ref_bits_offset, Entry, QueueView, RefBits,
    DOMAINS_PER_TOPIC, QUEUE_MAGIC,
};
use crate::queue::lock::{ExclusiveFileLock, SharedFileLock};

/// Fixed prefix of every queue segment name.
pub const QUEUE_PREFIX: &str = "hazcat.";

/// Turn a topic name into its queue segment name: prefix, then '.' for
/// every '/'. Oversize names are rejected rather than truncated, since a
/// truncated name could alias another topic's segment.
pub fn queue_name_for_topic(topic: &str) -> HazcatResult<String> {
    let trimmed = topic.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(HazcatError::invalid_argument("topic name must be non-empty"));
    }
    if trimmed.contains(|c: char| c.is_whitespace() || c == '\0') {
        return Err(HazcatError::invalid_argument(format!(
            "topic name '{topic}' contains whitespace or NUL"
        )));
    }
    let name = format!("{QUEUE_PREFIX}{}", trimmed.replace('/', "."));
    if name.len() > SHM_NAME_MAX {
        return Err(HazcatError::invalid_argument(format!(
            "topic name '{topic}' exceeds the shared memory name limit"
        )));
    }
    Ok(name)
}

/// Ring length backing a requested depth. Keeping headroom past `depth`
/// is what makes lapped subscribers detectable: the keep-last skew test can
/// only fire when the ring is longer than the history window.
pub(crate) fn ring_len_for(depth: u32) -> u32 {
    depth.saturating_mul(2).max(2).next_power_of_two()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EndpointKind {
    Publisher,
    Subscription,
}

/// What registration hands back to a new endpoint.
pub(crate) struct EndpointSlot {
    /// Column of the endpoint's memory domain in the queue.
    pub array_num: u32,
    /// First row a fresh subscriber should look at (publishers ignore it).
    pub next_index: u32,
}

pub(crate) struct QueueNode {
    name: String,
    seg: RwLock<SharedMemorySegment>,
    /// Same-process holders of the shared advisory lock.
    shared_locks: Mutex<u32>,
}

impl QueueNode {
    /// Open or create the queue for `name` and register the first local
    /// endpoint, all inside one exclusive critical section.
    pub fn open_registering(
        name: &str,
        depth: u32,
        domain: DomainId,
        kind: EndpointKind,
    ) -> HazcatResult<(QueueNode, EndpointSlot)> {
        if depth == 0 {
            return Err(HazcatError::invalid_argument("depth must be at least 1"));
        }
        for _ in 0..16 {
            let file = SharedMemorySegment::open_file(name)?;
            let lock = ExclusiveFileLock::acquire(&file)?;

            // The file we locked may have been unlinked by a tearing-down
            // peer between our open and the lock grant; start over on the
            // path's current inode.
            if !same_inode(&file, name)? {
                drop(lock);
                continue;
            }

            let size = file.metadata()?.len();
            let mut seg = if size == 0 {
                let len = ring_len_for(depth);
                let nd = if domain == DomainId::CPU { 1 } else { 2 };
                file.set_len(queue_segment_size(len, nd) as u64)?;
                let seg = SharedMemorySegment::from_file(file, name, false)?;
                init_queue_header(&seg, len, domain);
                log::debug!("created queue '{}' (len {}, {} domains)", name, len, nd);
                seg
            } else {
                let seg = SharedMemorySegment::from_file(file, name, false)?;
                validate_magic(&seg, name)?;
                seg
            };

            let slot = register_core(&mut seg, name, depth, domain, kind)?;
            drop(lock);
            return Ok((
                QueueNode {
                    name: name.to_string(),
                    seg: RwLock::new(seg),
                    shared_locks: Mutex::new(0),
                },
                slot,
            ));
        }
        Err(HazcatError::LockFailure(format!(
            "queue '{name}' kept being torn down while registering"
        )))
    }

    /// Register another local endpoint on an already-attached queue.
    pub fn register_endpoint(
        &self,
        depth: u32,
        domain: DomainId,
        kind: EndpointKind,
    ) -> HazcatResult<EndpointSlot> {
        let mut seg = self.seg.write();
        let _lock = ExclusiveFileLock::acquire(seg.file())?;
        if (seg.stat()? as usize) > seg.len() {
            seg.remap()?;
        }
        register_core(&mut seg, &self.name, depth, domain, kind)
    }

    /// Drop one endpoint. Returns true when this was the last endpoint
    /// anywhere and the queue segment was unlinked.
    pub fn unregister_endpoint(&self, kind: EndpointKind) -> HazcatResult<bool> {
        let mut seg = self.seg.write();
        let _lock = ExclusiveFileLock::acquire(seg.file())?;
        if (seg.stat()? as usize) > seg.len() {
            seg.remap()?;
        }

        let view = QueueView::new(&seg);
        let hdr = view.header();
        let counter = match kind {
            EndpointKind::Publisher => &hdr.pub_count,
            EndpointKind::Subscription => &hdr.sub_count,
        };
        let c = counter.load(Ordering::Relaxed);
        if c == 0 {
            return Err(HazcatError::CountOverflow(format!(
                "endpoint count underflow on queue '{}'",
                self.name
            )));
        }
        counter.store(c - 1, Ordering::Relaxed);

        let destroyed = hdr.pub_count.load(Ordering::Relaxed) == 0
            && hdr.sub_count.load(Ordering::Relaxed) == 0;
        if destroyed {
            SharedMemorySegment::unlink(&self.name)?;
            log::debug!("destroyed queue '{}'", self.name);
        }
        Ok(destroyed)
    }

    /// Run a data-plane operation under the shared advisory lock, against a
    /// mapping guaranteed to cover the queue's current shape.
    pub fn with_data<R>(&self, f: impl FnOnce(&QueueView) -> HazcatResult<R>) -> HazcatResult<R> {
        let mut f = Some(f);
        for _ in 0..4 {
            {
                let seg = self.seg.read();
                let lock = SharedFileLock::acquire(&self.shared_locks, seg.file())?;
                let view = QueueView::new(&seg);
                let hdr = view.header();
                let need = queue_segment_size(
                    hdr.len.load(Ordering::Acquire),
                    hdr.num_domains.load(Ordering::Acquire),
                );
                if need <= seg.len() {
                    let out = (f.take().expect("retried after success"))(&view);
                    drop(lock);
                    return out;
                }
                drop(lock);
            }
            // Another process grew the queue; refresh our mapping and retry.
            self.seg.write().remap()?;
        }
        Err(HazcatError::shared_memory(format!(
            "queue '{}' mapping is smaller than its header claims",
            self.name
        )))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(unix)]
fn same_inode(file: &File, name: &str) -> HazcatResult<bool> {
    use std::os::unix::fs::MetadataExt;
    let held = file.metadata()?;
    match std::fs::metadata(segment_path(name)) {
        Ok(on_disk) => Ok(held.ino() == on_disk.ino() && held.dev() == on_disk.dev()),
        Err(_) => Ok(false),
    }
}

/// Initialize a fresh queue header. Runs before the segment becomes visible
/// (exclusive lock held); magic is still written last so attachers can
/// reject torn creations after a crash.
fn init_queue_header(seg: &SharedMemorySegment, len: u32, domain: DomainId) {
    let view = QueueView::new(seg);
    let hdr = view.header();
    hdr.len.store(len, Ordering::Relaxed);
    hdr.domains[0].store(DomainId::CPU.raw(), Ordering::Relaxed);
    let mut nd = 1;
    if domain != DomainId::CPU {
        hdr.domains[1].store(domain.raw(), Ordering::Relaxed);
        nd = 2;
    }
    hdr.num_domains.store(nd, Ordering::Relaxed);
    // index, counts, ref bits and entries stay zero
    std::sync::atomic::fence(Ordering::Release);
    hdr.magic.store(QUEUE_MAGIC, Ordering::Release);
}

fn validate_magic(seg: &SharedMemorySegment, name: &str) -> HazcatResult<()> {
    if seg.len() < std::mem::size_of::<crate::queue::layout::QueueHeader>() {
        return Err(HazcatError::shared_memory(format!(
            "queue '{name}' is smaller than its header"
        )));
    }
    let magic = QueueView::new(seg).header().magic.load(Ordering::Acquire);
    if magic != QUEUE_MAGIC {
        return Err(HazcatError::shared_memory(format!(
            "queue '{name}' has invalid magic {magic:#018x} (crashed creator or incompatible version)"
        )));
    }
    Ok(())
}

/// Registration body shared by first-attach and later endpoints. Caller
/// holds the exclusive file lock and the node write lock.
fn register_core(
    seg: &mut SharedMemorySegment,
    name: &str,
    depth: u32,
    domain: DomainId,
    kind: EndpointKind,
) -> HazcatResult<EndpointSlot> {
    if depth == 0 {
        return Err(HazcatError::invalid_argument("depth must be at least 1"));
    }

    let (mut len, nd) = {
        let view = QueueView::new(seg);
        let hdr = view.header();
        (
            hdr.len.load(Ordering::Relaxed),
            hdr.num_domains.load(Ordering::Relaxed),
        )
    };

    // Find this endpoint's domain column, appending one if the topic has
    // never seen the domain.
    let existing = {
        let view = QueueView::new(seg);
        let hdr = view.header();
        (0..nd).find(|&d| hdr.domains[d as usize].load(Ordering::Relaxed) == domain.raw())
    };
    let (array_num, nd) = match existing {
        Some(d) => (d, nd),
        None => {
            if nd as usize == DOMAINS_PER_TOPIC {
                return Err(HazcatError::TooManyDomains(name.to_string()));
            }
            // One extra entry column at the tail; arrives zeroed.
            seg.resize(queue_segment_size(len, nd + 1))?;
            let view = QueueView::new(seg);
            let hdr = view.header();
            hdr.domains[nd as usize].store(domain.raw(), Ordering::Relaxed);
            hdr.num_domains.store(nd + 1, Ordering::Release);
            log::debug!("queue '{}': added domain column {} ({:#010x})", name, nd, domain.raw());
            (nd, nd + 1)
        }
    };

    // Deepen the ring if this endpoint asks for more history.
    let want = ring_len_for(depth);
    if want > len {
        grow_ring(seg, len, want, nd)?;
        log::debug!("queue '{}': grew ring {} -> {}", name, len, want);
        len = want;
    }

    let view = QueueView::new(seg);
    let hdr = view.header();
    let counter = match kind {
        EndpointKind::Publisher => &hdr.pub_count,
        EndpointKind::Subscription => &hdr.sub_count,
    };
    let c = counter.load(Ordering::Relaxed);
    if c == u16::MAX {
        return Err(HazcatError::CountOverflow(format!(
            "too many endpoints on queue '{name}'"
        )));
    }
    counter.store(c + 1, Ordering::Relaxed);

    Ok(EndpointSlot {
        array_num,
        next_index: hdr.index.load(Ordering::Relaxed) % len,
    })
}

/// Grow the ring from `old_len` to `new_len` rows, relocating the entry
/// columns whose offsets depend on the ring length. Highest column first:
/// every destination lies past the sources that still await their move.
fn grow_ring(
    seg: &mut SharedMemorySegment,
    old_len: u32,
    new_len: u32,
    nd: u32,
) -> HazcatResult<()> {
    seg.resize(queue_segment_size(new_len, nd))?;
    let base = seg.as_ptr();
    let esz = std::mem::size_of::<Entry>();

    for d in (0..nd).rev() {
        let src = entry_offset(old_len, d, 0);
        let dst = entry_offset(new_len, d, 0);
        // SAFETY: both ranges lie inside the freshly resized mapping; copy
        // handles the overlap within one column.
        unsafe {
            std::ptr::copy(base.add(src), base.add(dst), old_len as usize * esz);
            std::ptr::write_bytes(
                base.add(dst + old_len as usize * esz),
                0,
                (new_len - old_len) as usize * esz,
            );
        }
    }

    // The ref-bits array extends over what used to be column 0.
    // SAFETY: range inside the resized mapping.
    unsafe {
        std::ptr::write_bytes(
            base.add(ref_bits_offset(old_len)),
            0,
            (new_len - old_len) as usize * std::mem::size_of::<RefBits>(),
        );
    }

    QueueView::new(seg).header().len.store(new_len, Ordering::Release);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_become_flat_segment_names() {
        assert_eq!(queue_name_for_topic("/chatter").unwrap(), "hazcat.chatter");
        assert_eq!(
            queue_name_for_topic("/ns/camera/rgb").unwrap(),
            "hazcat.ns.camera.rgb"
        );
        assert_eq!(queue_name_for_topic("bare").unwrap(), "hazcat.bare");
        assert!(queue_name_for_topic("/").is_err());
        assert!(queue_name_for_topic("has space").is_err());
        let long = format!("/{}", "t".repeat(SHM_NAME_MAX));
        assert!(queue_name_for_topic(&long).is_err());
    }

    #[test]
    fn ring_len_keeps_headroom_past_depth() {
        for depth in 1..200u32 {
            let len = ring_len_for(depth);
            assert!(len > depth);
            assert!(len.is_power_of_two());
        }
        assert_eq!(ring_len_for(4), 8);
    }
}
