//! Per-process registry of attached allocators.
//!
//! Maps segment ids received over the wire (queue entries) to locally mapped
//! allocator handles. Open-addressed with linear probing; the table grows at
//! ~70% load. `get` attaches the segment on first sight, so any process can
//! resolve an allocator id another process published.

use std::sync::Arc;

use crate::error::{HazcatError, HazcatResult};
use crate::memory::allocator::Allocator;

struct Entry {
    id: u32,
    /// How many local endpoints registered this allocator. Attach-on-get
    /// entries for foreign allocators sit at zero and live until the
    /// registry is dropped.
    endpoints: u32,
    alloc: Arc<Allocator>,
}

pub struct AllocatorRegistry {
    slots: Vec<Option<Entry>>,
    mask: usize,
    len: usize,
}

impl AllocatorRegistry {
    pub fn new(capacity: usize) -> Self {
        let cap = capacity.next_power_of_two().max(8);
        Self {
            slots: (0..cap).map(|_| None).collect(),
            mask: cap - 1,
            len: 0,
        }
    }

    fn bucket_of(&self, id: u32) -> usize {
        // Fibonacci hashing spreads sequential ids across the table
        (id.wrapping_mul(0x9E37_79B9) as usize) & self.mask
    }

    fn find(&self, id: u32) -> Option<usize> {
        let mut i = self.bucket_of(id);
        loop {
            match &self.slots[i] {
                Some(e) if e.id == id => return Some(i),
                Some(_) => i = (i + 1) & self.mask,
                None => return None,
            }
        }
    }

    fn grow(&mut self) {
        let old = std::mem::replace(
            &mut self.slots,
            (0..(self.mask + 1) * 2).map(|_| None).collect(),
        );
        self.mask = self.slots.len() - 1;
        self.len = 0;
        for e in old.into_iter().flatten() {
            self.insert_entry(e);
        }
    }

    fn insert_entry(&mut self, e: Entry) {
        let mut i = self.bucket_of(e.id);
        while self.slots[i].is_some() {
            i = (i + 1) & self.mask;
        }
        self.slots[i] = Some(e);
        self.len += 1;
    }

    /// Register an endpoint's own allocator.
    pub fn insert(&mut self, alloc: Arc<Allocator>) {
        let id = alloc.shmem_id();
        if let Some(i) = self.find(id) {
            let e = self.slots[i].as_mut().expect("found slot is occupied");
            e.endpoints += 1;
            return;
        }
        if (self.len + 1) * 10 > (self.mask + 1) * 7 {
            self.grow();
        }
        self.insert_entry(Entry {
            id,
            endpoints: 1,
            alloc,
        });
    }

    /// Resolve an allocator id, attaching the segment if this process has
    /// not mapped it yet.
    pub fn get(&mut self, id: u32) -> HazcatResult<Arc<Allocator>> {
        if let Some(i) = self.find(id) {
            return Ok(Arc::clone(
                &self.slots[i].as_ref().expect("found slot is occupied").alloc,
            ));
        }
        let alloc = Arc::new(Allocator::attach(id)?);
        if (self.len + 1) * 10 > (self.mask + 1) * 7 {
            self.grow();
        }
        self.insert_entry(Entry {
            id,
            endpoints: 0,
            alloc: Arc::clone(&alloc),
        });
        Ok(alloc)
    }

    /// Look up without attaching.
    pub fn peek(&self, id: u32) -> Option<Arc<Allocator>> {
        self.find(id)
            .map(|i| Arc::clone(&self.slots[i].as_ref().expect("found slot is occupied").alloc))
    }

    /// Drop one endpoint's registration. The entry (and with it the local
    /// mapping) goes away when no local endpoint uses the allocator anymore.
    pub fn remove(&mut self, id: u32) -> HazcatResult<()> {
        let i = self
            .find(id)
            .ok_or_else(|| HazcatError::invalid_argument(format!("allocator {id:#010x} not registered")))?;
        {
            let e = self.slots[i].as_mut().expect("found slot is occupied");
            if e.endpoints > 1 {
                e.endpoints -= 1;
                return Ok(());
            }
        }
        self.evict(i);
        Ok(())
    }

    /// Remove slot `i`, re-inserting the probe run after it so lookups never
    /// hit a false hole.
    fn evict(&mut self, i: usize) {
        self.slots[i] = None;
        self.len -= 1;
        let mut j = (i + 1) & self.mask;
        while let Some(e) = self.slots[j].take() {
            self.len -= 1;
            self.insert_entry(e);
            j = (j + 1) & self.mask;
        }
    }

    /// Find the registered allocator whose data region contains `ptr`.
    pub fn matching(&self, ptr: *const u8) -> Option<Arc<Allocator>> {
        self.slots
            .iter()
            .flatten()
            .find(|e| e.alloc.contains(ptr))
            .map(|e| Arc::clone(&e.alloc))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut reg = AllocatorRegistry::new(8);
        let a = Allocator::cpu_ring(8, 4).unwrap();
        let id = a.shmem_id();
        reg.insert(a);
        assert_eq!(reg.len(), 1);

        let got = reg.get(id).unwrap();
        assert_eq!(got.shmem_id(), id);

        reg.remove(id).unwrap();
        assert!(reg.peek(id).is_none());
        assert!(reg.remove(id).is_err());
    }

    #[test]
    fn endpoint_counted_removal() {
        let mut reg = AllocatorRegistry::new(8);
        let a = Allocator::cpu_ring(8, 4).unwrap();
        let id = a.shmem_id();
        reg.insert(Arc::clone(&a));
        reg.insert(a);
        reg.remove(id).unwrap();
        assert!(reg.peek(id).is_some(), "second endpoint keeps the entry");
        reg.remove(id).unwrap();
        assert!(reg.peek(id).is_none());
    }

    #[test]
    fn get_attaches_unknown_ids() {
        let owner = Allocator::cpu_ring(8, 4).unwrap();
        let id = owner.shmem_id();

        let mut reg = AllocatorRegistry::new(8);
        let attached = reg.get(id).unwrap();
        assert_eq!(attached.shmem_id(), id);
        assert_eq!(reg.len(), 1);
        assert!(reg.get(9999).is_err(), "unknown segment id");
    }

    #[test]
    fn survives_growth_and_probe_runs() {
        let mut reg = AllocatorRegistry::new(8);
        let allocs: Vec<_> = (0..32)
            .map(|_| Allocator::cpu_ring(8, 2).unwrap())
            .collect();
        for a in &allocs {
            reg.insert(Arc::clone(a));
        }
        assert_eq!(reg.len(), 32);
        for a in &allocs {
            assert!(reg.peek(a.shmem_id()).is_some());
        }
        for a in &allocs {
            reg.remove(a.shmem_id()).unwrap();
        }
        assert!(reg.is_empty());
    }

    #[test]
    fn matching_finds_the_owning_pool() {
        let mut reg = AllocatorRegistry::new(8);
        let a = Allocator::cpu_ring(16, 2).unwrap();
        let b = Allocator::cpu_ring(16, 2).unwrap();
        reg.insert(Arc::clone(&a));
        reg.insert(Arc::clone(&b));

        let off = b.allocate(16).unwrap();
        let ptr = b.offset_to_ptr(off).unwrap();
        let found = reg.matching(ptr).unwrap();
        assert_eq!(found.shmem_id(), b.shmem_id());
    }
}
