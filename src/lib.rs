//! Unattended multi-account trading-robot server.
//!
//! One server instance coordinates many brokerage accounts: remote Execution
//! Agents poll it for queued commands and push terminal state, a per-cycle
//! master signal drives every account through the same guard chain, and a
//! database-backed lease lock keeps concurrent instances from ever executing
//! on the same account at once.

pub mod agent;
pub mod api;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod orchestrator;
pub mod persistence;
pub mod strategy;

pub use error::{MtLinkError, Result};
