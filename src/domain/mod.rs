//! Core domain types: account sessions, queued commands, trades and signals.

pub mod account;
pub mod command;
pub mod signal;
pub mod trade;

pub use account::{AccountSnapshot, AgentSession, Candle, Position, Quote, SessionToken};
pub use command::{Command, CommandKind, CommandOrigin, CommandStatus};
pub use signal::{MasterSignal, SignalAction, TradeSetup};
pub use trade::{Trade, TradeDirection, TradeStatus};
