//! peerfs daemon - filesystem export over peer-to-peer data channels
//!
//! A *publisher* wraps a local directory with the RPC server and exposes
//! it through labeled data channels; a *client* wires the same channels to
//! an RPC client and surfaces a filesystem-like API. Both sides rendezvous
//! through an external signaling relay and authenticate on a control
//! channel with a fingerprint-bound HMAC.

pub mod client;
pub mod connect;
pub mod local;
pub mod mime;
pub mod pairing;
pub mod publish;
pub mod server;
pub mod session;
pub mod shell;
pub mod thumbnail;
pub mod transport;
pub mod vfs;

#[cfg(test)]
mod testutil;

pub use client::FsClient;
pub use server::FsServer;
pub use vfs::{ReadOnlyVfs, Vfs};
