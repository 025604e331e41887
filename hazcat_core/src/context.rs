//! Per-process context: the allocator registry and the set of locally
//! attached topic queues.
//!
//! One `Context` per process replaces any process-global state; endpoints
//! keep a handle back to it so publish/take can resolve allocator ids they
//! meet in queue entries.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{HazcatError, HazcatResult};
use crate::memory::allocator::Allocator;
use crate::memory::registry::AllocatorRegistry;
use crate::queue::endpoint::{Publisher, Subscriber};
use crate::queue::node::{queue_name_for_topic, EndpointKind, EndpointSlot, QueueNode};

pub(crate) struct ContextInner {
    pub(crate) registry: Mutex<AllocatorRegistry>,
    pub(crate) queues: Mutex<HashMap<String, Arc<QueueNode>>>,
}

/// The per-process entry point. Create one at startup, register endpoints
/// through it, drop it last.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub fn new() -> HazcatResult<Self> {
        Ok(Self {
            inner: Arc::new(ContextInner {
                registry: Mutex::new(AllocatorRegistry::new(128)),
                queues: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Register a publisher on `topic`, publishing from `alloc`. `depth` is
    /// the keep-last history the topic must retain for subscribers.
    pub fn register_publisher(
        &self,
        topic: &str,
        alloc: Arc<Allocator>,
        depth: usize,
    ) -> HazcatResult<Publisher> {
        let (node, slot) = self.register(topic, &alloc, depth, EndpointKind::Publisher)?;
        Ok(Publisher::new(
            Arc::clone(&self.inner),
            node,
            alloc,
            topic.to_string(),
            slot.array_num,
        ))
    }

    /// Register a subscriber on `topic`, receiving into `alloc`'s memory
    /// domain. Existing messages are ignored; the subscriber starts at the
    /// current cursor.
    pub fn register_subscription(
        &self,
        topic: &str,
        alloc: Arc<Allocator>,
        depth: usize,
    ) -> HazcatResult<Subscriber> {
        let (node, slot) = self.register(topic, &alloc, depth, EndpointKind::Subscription)?;
        Ok(Subscriber::new(
            Arc::clone(&self.inner),
            node,
            alloc,
            topic.to_string(),
            slot.array_num,
            depth as u32,
            slot.next_index,
        ))
    }

    fn register(
        &self,
        topic: &str,
        alloc: &Arc<Allocator>,
        depth: usize,
        kind: EndpointKind,
    ) -> HazcatResult<(Arc<QueueNode>, EndpointSlot)> {
        let depth = u32::try_from(depth)
            .ok()
            .filter(|d| *d > 0)
            .ok_or_else(|| HazcatError::invalid_argument("depth must be in 1..=u32::MAX"))?;
        let name = queue_name_for_topic(topic)?;
        let domain = alloc.domain();

        let mut queues = self.inner.queues.lock();
        let (node, slot) = if let Some(node) = queues.get(&name).cloned() {
            let slot = node.register_endpoint(depth, domain, kind)?;
            (node, slot)
        } else {
            let (node, slot) = QueueNode::open_registering(&name, depth, domain, kind)?;
            let node = Arc::new(node);
            queues.insert(name, Arc::clone(&node));
            (node, slot)
        };
        drop(queues);

        self.inner.registry.lock().insert(Arc::clone(alloc));
        Ok((node, slot))
    }

    /// Resolve the registered allocator whose data region contains `ptr`.
    /// Used by callers releasing a message they hold only as a pointer.
    pub fn matching_allocator(&self, ptr: *const u8) -> Option<Arc<Allocator>> {
        self.inner.registry.lock().matching(ptr)
    }

    /// Number of allocators currently known to this process.
    pub fn known_allocators(&self) -> usize {
        self.inner.registry.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_topic(prefix: &str) -> String {
        format!(
            "/{}_{}_{}",
            prefix,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        )
    }

    #[test]
    fn register_and_unregister_round_trip() {
        let ctx = Context::new().unwrap();
        let topic = unique_topic("ctx_round_trip");
        let alloc = Allocator::cpu_ring(64, 8).unwrap();

        let p = ctx
            .register_publisher(&topic, Arc::clone(&alloc), 4)
            .unwrap();
        assert_eq!(ctx.known_allocators(), 1);
        let s = ctx
            .register_subscription(&topic, Arc::clone(&alloc), 4)
            .unwrap();

        p.unregister().unwrap();
        s.unregister().unwrap();
        assert_eq!(ctx.known_allocators(), 0);
        assert!(ctx.inner.queues.lock().is_empty(), "queue torn down");
    }

    #[test]
    fn rejects_zero_depth() {
        let ctx = Context::new().unwrap();
        let alloc = Allocator::cpu_ring(8, 2).unwrap();
        assert!(ctx
            .register_publisher(&unique_topic("zero_depth"), alloc, 0)
            .is_err());
    }

    #[test]
    fn matching_allocator_resolves_pointers() {
        let ctx = Context::new().unwrap();
        let topic = unique_topic("ctx_matching");
        let alloc = Allocator::cpu_ring(32, 4).unwrap();
        let _p = ctx
            .register_publisher(&topic, Arc::clone(&alloc), 2)
            .unwrap();

        let off = alloc.allocate(32).unwrap();
        let ptr = alloc.offset_to_ptr(off).unwrap();
        let found = ctx.matching_allocator(ptr).unwrap();
        assert_eq!(found.shmem_id(), alloc.shmem_id());
        alloc.deallocate(off);
    }
}
