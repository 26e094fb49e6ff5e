//! shoal-core: cross-cutting server plumbing.
//!
//! Everything the server entry, dispatch path, and index manager share
//! but that isn't tied to one of them: the server-wide error kinds,
//! the hot-path matrix counters, the bounded worker pool, the key→shard
//! segment manager with its per-shard read/write locks, and the
//! pessimistic per-key lock tables.

pub mod error;
pub mod matrix;
pub mod pessimistic;
pub mod pool;
pub mod segment;

pub use error::Error;
pub use matrix::{NetworkMatrix, PoolMatrix, RequestMatrix};
pub use pessimistic::PessimisticMgr;
pub use pool::WorkerPool;
pub use segment::{DbGuard, LockMode, SegmentMgr};
