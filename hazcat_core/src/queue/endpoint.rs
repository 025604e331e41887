//! Publishers, subscribers and the RAII message handles they exchange.
//!
//! A publisher allocates a slot from its own allocator, writes the payload
//! there and publishes only the `(allocator id, offset, len)` entry. A
//! subscriber taking the message either reuses a copy already present in its
//! memory domain (raising its reference count - the zero-copy path) or makes
//! the one lazy copy for its domain and records it in the same ring row for
//! later takers.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::context::ContextInner;
use crate::error::{HazcatError, HazcatResult};
use crate::memory::allocator::{Allocator, DeviceType};
use crate::queue::layout::Entry;
use crate::queue::lock::spin_lock;
use crate::queue::node::{EndpointKind, QueueNode};

/// A loaned slot in the publisher's allocator.
///
/// Write the payload (directly for host rings, via [`write`](Sample::write)
/// for any domain), then hand the sample to [`Publisher::publish`]. Dropping
/// an unpublished sample returns the slot to the ring.
pub struct Sample {
    alloc: Arc<Allocator>,
    offset: u32,
    cap: usize,
    armed: bool,
}

impl Sample {
    /// Offset of the loaned slot, relative to its allocator header.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Usable bytes in the slot (the allocator's fixed stride).
    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.alloc
    }

    /// Direct mutable access for host-backed allocators; `None` when the
    /// slot lives in device memory.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        let ptr = self.alloc.host_ptr(self.offset)?;
        // SAFETY: the slot is exclusively loaned to this sample and spans
        // `cap` bytes inside the mapping.
        Some(unsafe { std::slice::from_raw_parts_mut(ptr, self.cap) })
    }

    /// Copy payload bytes into the slot, whatever domain it lives in.
    pub fn write(&mut self, data: &[u8]) -> HazcatResult<()> {
        if data.len() > self.cap {
            return Err(HazcatError::invalid_argument(format!(
                "payload of {} bytes exceeds slot capacity {}",
                data.len(),
                self.cap
            )));
        }
        self.alloc.copy_to(self.offset, data)
    }
}

impl Drop for Sample {
    fn drop(&mut self) {
        if self.armed {
            self.alloc.deallocate(self.offset);
        }
    }
}

/// A taken message: the owning allocator, the payload's offset and length.
///
/// Holds one reference on the allocation; dropping the handle releases it.
pub struct MessageRef {
    alloc: Arc<Allocator>,
    offset: u32,
    len: usize,
}

impl MessageRef {
    pub(crate) fn new(alloc: Arc<Allocator>, offset: u32, len: usize) -> Self {
        Self { alloc, offset, len }
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.alloc
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Zero-copy view of the payload for host-domain messages; `None` when
    /// the payload lives in device memory.
    pub fn as_slice(&self) -> Option<&[u8]> {
        let ptr = self.alloc.host_ptr(self.offset)?;
        // SAFETY: the allocation is held live by this handle's reference and
        // spans `len` bytes inside the mapping.
        Some(unsafe { std::slice::from_raw_parts(ptr, self.len) })
    }

    /// Copy the payload to host memory, whatever domain it lives in.
    pub fn read_to_vec(&self) -> HazcatResult<Vec<u8>> {
        let mut out = vec![0u8; self.len];
        self.alloc.copy_from(self.offset, &mut out)?;
        Ok(out)
    }

    /// Decode the payload as a plain-old-data value.
    pub fn value<T: bytemuck::Pod>(&self) -> HazcatResult<T> {
        let bytes = self.read_to_vec()?;
        if bytes.len() < std::mem::size_of::<T>() {
            return Err(HazcatError::invalid_argument(format!(
                "payload of {} bytes too short for {}",
                bytes.len(),
                std::any::type_name::<T>()
            )));
        }
        Ok(bytemuck::pod_read_unaligned(
            &bytes[..std::mem::size_of::<T>()],
        ))
    }
}

impl Drop for MessageRef {
    fn drop(&mut self) {
        self.alloc.deallocate(self.offset);
    }
}

/// A registered publisher endpoint on one topic.
pub struct Publisher {
    ctx: Arc<ContextInner>,
    node: Arc<QueueNode>,
    alloc: Arc<Allocator>,
    topic: String,
    array_num: u32,
    closed: bool,
}

impl Publisher {
    pub(crate) fn new(
        ctx: Arc<ContextInner>,
        node: Arc<QueueNode>,
        alloc: Arc<Allocator>,
        topic: String,
        array_num: u32,
    ) -> Self {
        Self {
            ctx,
            node,
            alloc,
            topic,
            array_num,
            closed: false,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.alloc
    }

    /// Loan a slot from this publisher's allocator for zero-copy writing.
    pub fn loan(&self) -> HazcatResult<Sample> {
        let cap = self.alloc.item_size();
        let offset = self.alloc.allocate(cap).ok_or_else(|| {
            HazcatError::no_space(format!(
                "allocator {:#010x} has no free slots",
                self.alloc.shmem_id()
            ))
        })?;
        Ok(Sample {
            alloc: Arc::clone(&self.alloc),
            offset,
            cap,
            armed: true,
        })
    }

    /// Publish a loaned sample's first `len` bytes. Ownership of the
    /// allocation moves into the queue row.
    pub fn publish(&self, mut sample: Sample, len: usize) -> HazcatResult<()> {
        if !Arc::ptr_eq(&sample.alloc, &self.alloc) {
            return Err(HazcatError::invalid_argument(
                "sample was not loaned from this publisher's allocator",
            ));
        }
        if len > sample.cap {
            return Err(HazcatError::invalid_argument(format!(
                "payload length {} exceeds slot capacity {}",
                len, sample.cap
            )));
        }
        self.publish_entry(sample.offset, len)?;
        sample.armed = false;
        Ok(())
    }

    /// Loan, copy and publish in one call.
    pub fn publish_bytes(&self, payload: &[u8]) -> HazcatResult<()> {
        let mut sample = self.loan()?;
        sample.write(payload)?;
        self.publish(sample, payload.len())
    }

    /// Publish a plain-old-data value.
    pub fn publish_value<T: bytemuck::Pod>(&self, value: &T) -> HazcatResult<()> {
        self.publish_bytes(bytemuck::bytes_of(value))
    }

    fn publish_entry(&self, offset: u32, len: usize) -> HazcatResult<()> {
        let entry = Entry {
            alloc_shmem_id: self.alloc.shmem_id(),
            offset,
            len: len as u32,
        };

        self.node.with_data(|view| {
            let hdr = view.header();
            let qlen = hdr.len.load(Ordering::SeqCst);

            // Claim a slot, then fold the cursor back into [0, len). The
            // cursor may transiently sit past the ring length between the
            // two steps; every row access reduces modulo len.
            let i = hdr.index.fetch_add(1, Ordering::SeqCst);
            let mut expect = i.wrapping_add(1);
            while let Err(cur) = hdr.index.compare_exchange_weak(
                expect,
                expect % qlen,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                expect = cur;
            }
            let row = i % qlen;

            let rb = view.ref_bits(qlen, row);
            let _row_lock = spin_lock(&rb.lock);

            // Overwrite-on-full: lapped subscribers lose this row, so every
            // copy it still holds goes back to its allocator. Keyed on the
            // availability mask, which also covers rows published while no
            // subscriber was registered (live entries, zero interest).
            let avail = rb.availability.load(Ordering::Relaxed);
            if avail != 0 {
                let nd = hdr.num_domains.load(Ordering::Relaxed);
                for d in 0..nd {
                    if avail & (1 << d) != 0 {
                        let e = view.entry(qlen, d, row);
                        match self.ctx.registry.lock().get(e.alloc_shmem_id) {
                            Ok(a) => a.deallocate(e.offset),
                            Err(err) => log::warn!(
                                "queue '{}': dropping unreachable copy in row {}: {}",
                                self.node.name(),
                                row,
                                err
                            ),
                        }
                    }
                }
                rb.availability.store(0, Ordering::Relaxed);
            }

            view.set_entry(qlen, self.array_num, row, entry);
            rb.availability.store(1 << self.array_num, Ordering::Relaxed);
            rb.interest_count
                .store(hdr.sub_count.load(Ordering::Relaxed) as u32, Ordering::Relaxed);
            Ok(())
        })
    }

    /// Tear the endpoint down explicitly, surfacing any error.
    pub fn unregister(mut self) -> HazcatResult<()> {
        self.do_unregister()
    }

    fn do_unregister(&mut self) -> HazcatResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        unregister_endpoint(
            &self.ctx,
            &self.node,
            &self.alloc,
            EndpointKind::Publisher,
        )
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if let Err(e) = self.do_unregister() {
            log::warn!("publisher on '{}' failed to unregister: {}", self.topic, e);
        }
    }
}

/// A registered subscriber endpoint on one topic.
pub struct Subscriber {
    ctx: Arc<ContextInner>,
    node: Arc<QueueNode>,
    alloc: Arc<Allocator>,
    topic: String,
    array_num: u32,
    depth: u32,
    next_index: u32,
    closed: bool,
}

impl Subscriber {
    pub(crate) fn new(
        ctx: Arc<ContextInner>,
        node: Arc<QueueNode>,
        alloc: Arc<Allocator>,
        topic: String,
        array_num: u32,
        depth: u32,
        next_index: u32,
    ) -> Self {
        Self {
            ctx,
            node,
            alloc,
            topic,
            array_num,
            depth,
            next_index,
            closed: false,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.alloc
    }

    /// Take the next message, skipping anything older than `depth` rows
    /// behind the publishers' cursor. `Ok(None)` when caught up.
    pub fn take(&mut self) -> HazcatResult<Option<MessageRef>> {
        let array_num = self.array_num;
        let depth = self.depth;
        let start = self.next_index;

        let (next_index, msg) = self.node.with_data(|view| {
            let hdr = view.header();
            let qlen = hdr.len.load(Ordering::SeqCst);
            let idx = hdr.index.load(Ordering::SeqCst) % qlen;

            // Keep-last: clamp the cursor to the newest `depth` rows.
            let mut i = start % qlen;
            let skew = (idx + qlen - i) % qlen;
            if skew > depth {
                i = (idx + qlen - depth) % qlen;
            }

            loop {
                if i == idx {
                    return Ok((i, None));
                }
                let rb = view.ref_bits(qlen, i);
                let row_lock = spin_lock(&rb.lock);
                let avail = rb.availability.load(Ordering::Relaxed);
                if avail == 0 {
                    // Row already torn down (all interest consumed)
                    drop(row_lock);
                    i = (i + 1) % qlen;
                    continue;
                }

                let msg = if avail & (1 << array_num) != 0 {
                    // Zero-copy: our domain already holds this message
                    let e = view.entry(qlen, array_num, i);
                    let src = self.ctx.registry.lock().get(e.alloc_shmem_id)?;
                    src.share(e.offset);
                    MessageRef::new(src, e.offset, e.len as usize)
                } else {
                    self.copy_into_own_domain(view, qlen, i, avail)?
                };

                let left = rb.interest_count.load(Ordering::Relaxed).saturating_sub(1);
                rb.interest_count.store(left, Ordering::Relaxed);
                if left == 0 {
                    // Last interested subscriber: release every copy
                    let nd = hdr.num_domains.load(Ordering::Relaxed);
                    let avail = rb.availability.load(Ordering::Relaxed);
                    for d in 0..nd {
                        if avail & (1 << d) != 0 {
                            let e = view.entry(qlen, d, i);
                            match self.ctx.registry.lock().get(e.alloc_shmem_id) {
                                Ok(a) => a.deallocate(e.offset),
                                Err(err) => log::warn!(
                                    "queue '{}': leaking copy in row {}: {}",
                                    self.node.name(),
                                    i,
                                    err
                                ),
                            }
                        }
                    }
                    rb.availability.store(0, Ordering::Relaxed);
                }

                return Ok(((i + 1) % qlen, Some(msg)));
            }
        })?;

        self.next_index = next_index;
        Ok(msg)
    }

    /// Lazy cross-domain copy: pull the row's message from the lowest
    /// available column into this subscriber's allocator and record the new
    /// copy for later takers in the same domain. Runs under the row lock.
    fn copy_into_own_domain(
        &self,
        view: &crate::queue::layout::QueueView<'_>,
        qlen: u32,
        i: u32,
        avail: u32,
    ) -> HazcatResult<MessageRef> {
        let d_src = avail.trailing_zeros();
        let e = view.entry(qlen, d_src, i);
        let src = self.ctx.registry.lock().get(e.alloc_shmem_id)?;
        let len = e.len as usize;
        if len > self.alloc.item_size() {
            return Err(HazcatError::invalid_argument(format!(
                "message of {} bytes exceeds the subscriber's {}-byte stride",
                len,
                self.alloc.item_size()
            )));
        }

        let dst_off = self.alloc.allocate(len).ok_or_else(|| {
            HazcatError::no_space(format!(
                "allocator {:#010x} full while copying a take",
                self.alloc.shmem_id()
            ))
        })?;

        let copied = if src.device_type() == DeviceType::Cpu {
            let ptr = src.host_ptr(e.offset).expect("cpu allocator has host bytes");
            // SAFETY: the entry is live (row lock held) and spans `len`
            // bytes of the source mapping.
            let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
            self.alloc.copy_to(dst_off, bytes)
        } else if self.alloc.device_type() == DeviceType::Cpu {
            let ptr = self
                .alloc
                .host_ptr(dst_off)
                .expect("cpu allocator has host bytes");
            // SAFETY: dst_off was just allocated and spans `len` bytes.
            let bytes = unsafe { std::slice::from_raw_parts_mut(ptr, len) };
            src.copy_from(e.offset, bytes)
        } else {
            self.alloc.copy(dst_off, &src, e.offset, len)
        };
        if let Err(err) = copied {
            self.alloc.deallocate(dst_off);
            return Err(err);
        }

        view.set_entry(
            qlen,
            self.array_num,
            i,
            Entry {
                alloc_shmem_id: self.alloc.shmem_id(),
                offset: dst_off,
                len: e.len,
            },
        );
        let rb = view.ref_bits(qlen, i);
        rb.availability
            .store(avail | (1 << self.array_num), Ordering::Relaxed);

        // One reference stays with the row, one goes to the reader.
        self.alloc.share(dst_off);
        Ok(MessageRef::new(Arc::clone(&self.alloc), dst_off, len))
    }

    /// Tear the endpoint down explicitly, surfacing any error.
    pub fn unregister(mut self) -> HazcatResult<()> {
        self.do_unregister()
    }

    fn do_unregister(&mut self) -> HazcatResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        unregister_endpoint(
            &self.ctx,
            &self.node,
            &self.alloc,
            EndpointKind::Subscription,
        )
    }

    /// Ring cursor and length, for tests and diagnostics.
    #[doc(hidden)]
    pub fn debug_cursor(&self) -> HazcatResult<(u32, u32)> {
        self.node.with_data(|view| {
            let hdr = view.header();
            let qlen = hdr.len.load(Ordering::SeqCst);
            Ok((hdr.index.load(Ordering::SeqCst) % qlen, qlen))
        })
    }

    /// Interest count and availability mask of ring row `i`, for tests and
    /// diagnostics.
    #[doc(hidden)]
    pub fn debug_row(&self, i: u32) -> HazcatResult<(u32, u32)> {
        self.node.with_data(|view| {
            let hdr = view.header();
            let qlen = hdr.len.load(Ordering::SeqCst);
            let rb = view.ref_bits(qlen, i % qlen);
            Ok((
                rb.interest_count.load(Ordering::Relaxed),
                rb.availability.load(Ordering::Relaxed),
            ))
        })
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if let Err(e) = self.do_unregister() {
            log::warn!("subscriber on '{}' failed to unregister: {}", self.topic, e);
        }
    }
}

fn unregister_endpoint(
    ctx: &Arc<ContextInner>,
    node: &Arc<QueueNode>,
    alloc: &Arc<Allocator>,
    kind: EndpointKind,
) -> HazcatResult<()> {
    ctx.registry.lock().remove(alloc.shmem_id())?;
    let destroyed = node.unregister_endpoint(kind)?;
    if destroyed {
        ctx.queues.lock().remove(node.name());
    }
    Ok(())
}
