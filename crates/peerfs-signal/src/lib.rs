//! peerfs signaling - relay wire messages and the WebSocket client
//!
//! Two endpoints rendezvous through a third-party relay: a persistent
//! full-duplex JSON message stream keyed by a room id. This crate speaks
//! the relay protocol (register / accept / offer / answer / candidate /
//! keep-alive) and buffers locally-gathered ICE candidates until the
//! remote description has been seen.

pub mod client;
pub mod messages;

pub use client::{PeerSignal, SignalError, SignalingConn};
pub use messages::{AuthResult, IceCandidateInit, IceServer, SignalingMessage};
