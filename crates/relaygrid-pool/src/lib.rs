//! relaygrid-pool — per-host worker process pool.
//!
//! Keeps a warm set of worker processes on one host and hands them out over
//! the message bus.
//!
//! # Architecture
//!
//! ```text
//! Pool agent
//!   ├── service (relay.pool + relay.pool.<agentId>)
//!   │   ├── createWorker → WorkerPool::get_worker + fill
//!   │   ├── dropWorker / isWorkerAlive / getPoolInfo
//!   └── WorkerPool
//!       ├── idle (FIFO) / busy (round-robin reuse)
//!       ├── supervisor task per worker → purge + refill on exit
//!       └── Launcher → ProcessLauncher (detached OS processes)
//! ```

pub mod address;
pub mod error;
pub mod launcher;
pub mod pool;
pub mod service;

pub use address::HostAddress;
pub use error::{PoolError, PoolResult};
pub use launcher::{LaunchSpec, Launcher, ProcessLauncher, WorkerProcess};
pub use pool::WorkerPool;
pub use service::{pool_methods, serve};
