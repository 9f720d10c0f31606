//! WebSocket endpoint.
//!
//! - `connection`: per-client lifecycle, from upgrade to teardown.
//! - `transport`: the socket's write half as seen by the core session.

mod connection;
pub mod transport;

pub use connection::ws_handler;
