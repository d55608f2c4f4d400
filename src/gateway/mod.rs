//! Broker HTTP gateway: client trait, REST implementation and the
//! per-account session lifecycle manager.

pub mod rest;
pub mod session;
pub mod traits;

pub use rest::RestGateway;
pub use session::SessionManager;
pub use traits::{BrokerGateway, OrderRequest, PlacementResult};

#[cfg(test)]
pub use traits::MockBrokerGateway;
