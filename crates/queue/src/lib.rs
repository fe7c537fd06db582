//! `queue` crate: job queue, publish/subscribe bus, and request/response
//! correlation.
//!
//! Everything here is transport: payloads are generic (or plain JSON for the
//! bus) so the crate carries no workflow types. Durable backends live in the
//! `db` crate and implement the same traits.

pub mod bus;
pub mod correlator;
pub mod error;
pub mod job;
pub mod memory;

pub use bus::{EventBus, MemoryBus, Subscription};
pub use correlator::Correlator;
pub use error::QueueError;
pub use job::{EnqueueOptions, Job, JobQueue, Priority};
pub use memory::MemoryQueue;
