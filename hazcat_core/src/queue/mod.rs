//! Per-topic shared message queues.
//!
//! Each topic is one shared segment holding a ring of reference-counted rows
//! and one entry column per memory domain. Registration and structural
//! growth serialize on an exclusive advisory file lock; publish and take run
//! concurrently under a shared lock plus per-row spin locks.

pub mod endpoint;
pub mod layout;
pub(crate) mod lock;
pub(crate) mod node;

pub use endpoint::{MessageRef, Publisher, Sample, Subscriber};
pub use layout::{Entry, QueueHeader, RefBits, DOMAINS_PER_TOPIC};
pub use node::{queue_name_for_topic, QUEUE_PREFIX};
