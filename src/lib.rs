// Library crate for integration tests and for test harnesses that embed the
// collectors and the transport client.

pub mod auth;
pub mod collector;
pub mod config;
pub mod error;
pub mod metrics;
pub mod routes;
pub mod server;
pub mod state;
pub mod transport;
