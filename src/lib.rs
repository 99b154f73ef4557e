//! # swarm-core
//!
//! A distributed task scheduling and dispatch engine: remote worker
//! bots poll this service for short-lived jobs, run them, and stream
//! results back.
//!
//! ## Architecture
//!
//! - **Scheduler**: the matching loop — submission, bot claim, bot
//!   update, cancellation.
//! - **Dimension Index**: per-pool reverse index of pending requests,
//!   matched against a bot's advertised dimensions.
//! - **Request/Result Store**: immutable task requests and their
//!   mutable result state machines.
//! - **Dedup Cache**: replaces execution with a reference to a prior
//!   equivalent completed run for idempotent requests.
//! - **Bot Registry**: presence, assignment, and quarantine tracking.
//! - **Lifecycle Timers / Cancellation Worker**: background sweeps and
//!   tag-driven bulk cancellation.

/// In-process ACL checker and service-account validation
pub mod acl;
/// HTTP API server and endpoints
pub mod api;
/// Caller authorization middleware
pub mod auth;
/// Bot presence and assignment tracking
pub mod bots;
/// Task id pack/unpack codec
pub mod codec;
/// System configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// Error types and handling
pub mod error;
/// Monotonic request id generation
pub mod idgen;
/// Background maintenance: expiry, bot-death, dedup pruning, bulk cancel
pub mod lifecycle;
/// Core data model
pub mod model;
/// Rate limiting
pub mod rate_limit;
/// The matching loop and its component stores
pub mod scheduler;
/// Observability snapshot
pub mod stats;
/// Input validation
pub mod validation;

pub use error::{Result, SwarmError};
