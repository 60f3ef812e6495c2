//! `juncture` — concurrent collections and task-execution primitives
//! inspired by the JSR-166 utilities: bounded/unbounded blocking queues,
//! a segmented concurrent hash map, a synchronous rendezvous channel, a
//! delay-ordered priority queue, a cancellable future, and a
//! worker-thread pool that consumes tasks from a pluggable queue.
//!
//! ## Layout
//!
//! - [`queue`] — the blocking-queue family ([`queue::ArrayBlockingQueue`],
//!   [`queue::TransferQueue`], [`queue::RendezvousQueue`],
//!   [`queue::DelayQueue`]), all implementing the shared [`queue::Queue`]
//!   trait.
//! - [`map`] — [`map::ConcurrentHashMap`], a segmented hash table whose
//!   writes are lock-partitioned (one `parking_lot::Mutex` per segment)
//!   but whose reads are genuinely lock-free.
//! - [`future`] — [`future::Task`]/[`future::JoinHandle`], an at-most-once
//!   cancellable future with many-waiter parking.
//! - [`pool`] — [`pool::ThreadPool`], a core/max-sized worker pool over
//!   any [`queue::Queue`].
//! - [`config`] — fluent builders over [`pool::PoolConfig`] and
//!   [`map::MapConfig`].
//! - [`policy`] — pluggable [`policy::RejectionPolicy`] implementations.
//! - [`error`] — the crate-wide [`error::JunctureError`] taxonomy.
//! - [`cancel`], [`sync`], [`time`] — cooperative cancellation, the
//!   shared condvar-wait helper, and deadline arithmetic that every
//!   blocking component above is built on.

pub mod cancel;
pub mod config;
pub mod error;
pub mod future;
pub mod map;
pub mod policy;
pub mod pool;
pub mod queue;
pub mod sync;
pub mod time;

pub use error::{JunctureError, Result};
