//! The RPC surface: typed messages, the service implementing every method,
//! and the HTTP server wiring.

pub mod messages;
pub mod server;
pub mod service;

pub use messages::*;
pub use service::DepiService;
