//! HTTP surface: the agent poll endpoint plus a small operator API.

pub mod auth;
pub mod routes;
pub mod state;

pub use routes::router;
pub use state::AppState;
