//! Scheduling: slot limits, the retry policy and the worker pool that
//! drives queued jobs through execution.
//!
//! A job runs only while holding a [`SlotPermit`], which combines one of the
//! `max_concurrent_processes` global slots with one of its owner's
//! `max_concurrent_per_user` slots. Deliveries are at-least-once; the pool
//! skips any job that is not `pending` and relies on the atomic `Start`
//! transition to settle races between duplicate deliveries.

mod cancel;
mod pool;
mod retry;
mod slots;
mod types;

pub use cancel::{CancellationGuard, CancellationRegistry};
pub use pool::WorkerPool;
pub use retry::{RetryDecision, RetryPolicy};
pub use slots::{GlobalSlot, OwnerSlot, SlotLimiter, SlotPermit};
pub use types::{JobOutcome, PoolStatus, SchedulerError};
