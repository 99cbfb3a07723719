//! The `transport` module exposes the broker to remote peers over WebSockets.
//!
//! It defines the JSON protocol spoken with peers and the server that maps
//! each frame onto a broker operation, streaming delivered messages back.

pub mod message;
pub mod websocket;

pub use message::{ClientMessage, ErrorCode, ServerMessage};
pub use websocket::{serve, start_websocket_server};
