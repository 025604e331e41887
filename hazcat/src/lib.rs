//! # hazcat
//!
//! Heterogeneous zero-copy pub/sub for processes sharing one host: messages
//! move between memory domains (CPU, CUDA devices) with at most one lazy
//! copy per destination domain.
//!
//! This crate is the user-facing facade; the machinery lives in
//! [`hazcat_core`].
//!
//! ```rust,no_run
//! use hazcat::prelude::*;
//!
//! # fn main() -> hazcat::HazcatResult<()> {
//! let ctx = Context::new()?;
//! let pool = Allocator::cpu_ring(256, 8)?;
//! let publisher = ctx.register_publisher("/sensors/imu", pool, 4)?;
//! publisher.publish_bytes(&[1, 2, 3])?;
//! # Ok(())
//! # }
//! ```

pub use hazcat_core::{self, *};

// Re-export bytemuck at crate root for payload derive usage
pub use bytemuck;

/// Everything you need to get started.
pub mod prelude {
    pub use hazcat_core::context::Context;
    pub use hazcat_core::error::{HazcatError, HazcatResult};
    pub use hazcat_core::memory::{Allocator, DeviceType, DomainId};
    pub use hazcat_core::queue::{MessageRef, Publisher, Sample, Subscriber};
}
