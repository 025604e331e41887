//! # hazcat core
//!
//! A heterogeneous, zero-copy, cross-process publish/subscribe transport.
//! Processes on one host exchange messages across distinct memory domains
//! (host RAM, CUDA device memory) with at most one lazy copy per destination
//! domain, shared by every subscriber living there.
//!
//! Building blocks:
//!
//! - **Allocators**: fixed-stride ring pools in shared memory, one per
//!   domain, addressable by every process through a portable segment id
//! - **Message queues**: one shared ring per topic carrying
//!   `(allocator, offset, len)` entries and the reference bits that drive
//!   lazy cross-domain copies and refcount-based reclamation
//! - **Context**: the per-process registry resolving allocator ids received
//!   from peers into locally mapped pools
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use hazcat_core::{Allocator, Context};
//!
//! # fn main() -> hazcat_core::HazcatResult<()> {
//! let ctx = Context::new()?;
//! let pool = Allocator::cpu_ring(1024, 16)?;
//!
//! let publisher = ctx.register_publisher("/chatter", pool.clone(), 4)?;
//! publisher.publish_bytes(b"hello")?;
//!
//! let mut subscriber = ctx.register_subscription("/chatter", pool, 4)?;
//! if let Some(msg) = subscriber.take()? {
//!     println!("got {} bytes", msg.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod error;
pub mod memory;
pub mod queue;

pub use context::Context;
pub use error::{HazcatError, HazcatResult};
pub use memory::{AllocStrategy, Allocator, AllocatorHeader, DeviceType, DomainId};
pub use queue::{MessageRef, Publisher, Sample, Subscriber, DOMAINS_PER_TOPIC};

// Re-export bytemuck for consistent Pod trait usage in downstream crates
pub use bytemuck;
