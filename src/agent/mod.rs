//! Execution-Agent bridge: the poll contract served to the remote terminal
//! script, and the handler that owns the session cache and command queue.

pub mod handler;
pub mod protocol;

pub use handler::ProtocolHandler;
pub use protocol::{
    CommandPayload, ExecutionResult, ManualCommandRequest, SyncRequest, SyncResponse,
};
