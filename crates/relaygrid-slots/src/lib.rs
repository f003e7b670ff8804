//! relaygrid-slots — per-room worker slots.
//!
//! A room keeps one [`SlotRegistry`]: a ring of worker slots indexed by
//! stream position. The [`WorkerAllocator`] fills slots by calling
//! `createWorker` on the shared pool queue, lets concurrent callers for the
//! same slot share one allocation, releases workers on their owning agent,
//! and sweeps keepalives.

pub mod allocator;
pub mod error;
pub mod registry;

pub use allocator::WorkerAllocator;
pub use error::{SlotError, SlotResult};
pub use registry::{SlotRegistry, WorkerSlot, WorkerWaiter};
