//! Background maintenance: expiry, bot-death reclamation, dedup pruning,
//! and tag-driven bulk cancellation.

pub mod cancellation_worker;
pub mod timers;

pub use cancellation_worker::{BulkCancelReport, CancellationWorker};
pub use timers::LifecycleTimer;
