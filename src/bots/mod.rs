//! Bot presence and assignment tracking.

pub mod registry;

pub use registry::{AvailabilityCounts, BotFilter, BotRegistry};
