//! waypoint/src/http/mod.rs
//! The HTTP side of the dispatch engine: the proxy recipient state machine
//! (spec.md §4.E), the upstream HTTP-CONNECT client handshake (§4.F), and
//! the message/framing types they share.

pub mod connect_client;
pub mod message;
pub mod recipient;

pub use message::RequestHead;
