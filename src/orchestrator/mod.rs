//! Multi-account trading orchestrator.
//!
//! One cycle computes a single master signal and runs the execution guard
//! chain for every configured account against it. Cycles are single-flight
//! per process; the per-account execution lock covers everything beyond one
//! process.

pub mod cycle;
pub mod guard;
pub mod scheduler;

pub use cycle::{CycleReport, Orchestrator};
pub use guard::{ExecutionGuard, GuardOutcome, SkipReason};
