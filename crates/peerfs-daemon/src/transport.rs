//! Peer transport abstraction
//!
//! The data-channel stack (ICE/DTLS/SCTP) is an external collaborator: a
//! library providing ordered reliable channels with open/message/close
//! notifications and DTLS certificate fingerprints. These traits are the
//! seam the session orchestrator is written against; embedders register
//! the concrete stack once at startup.

use std::sync::{Arc, OnceLock};

use tokio::sync::mpsc;

use peerfs_core::FsError;
use peerfs_signal::{IceCandidateInit, IceServer};

/// Peer-connection states the orchestrator reacts to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// States that tear the whole session down.
    pub fn is_fatal(self) -> bool {
        matches!(self, PeerState::Failed | PeerState::Disconnected | PeerState::Closed)
    }
}

/// Everything the transport reports back to the orchestrator.
pub enum PeerEvent {
    /// A locally gathered ICE candidate to relay to the peer.
    IceCandidate(IceCandidateInit),
    StateChange(PeerState),
    ChannelOpen { label: String, channel: Arc<dyn DataChannel> },
    ChannelMessage { label: String, data: Vec<u8>, is_text: bool },
    ChannelClose { label: String },
}

/// An ordered reliable data channel.
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    fn send_text(&self, text: &str) -> Result<(), FsError>;
    fn send(&self, data: &[u8]) -> Result<(), FsError>;
}

/// One peer connection. Offer/answer calls set the corresponding local
/// and remote descriptions as a side effect.
pub trait PeerTransport: Send + Sync {
    /// Pre-create a channel; only the offerer does this, before the offer.
    fn declare_channel(&self, label: &str) -> Result<(), FsError>;

    fn create_offer(&self) -> Result<String, FsError>;

    /// Apply a remote offer and produce the answer.
    fn accept_offer(&self, sdp: &str) -> Result<String, FsError>;

    fn accept_answer(&self, sdp: &str) -> Result<(), FsError>;

    fn add_remote_candidate(&self, candidate: &IceCandidateInit) -> Result<(), FsError>;

    /// Hex fingerprint of the local DTLS certificate.
    fn local_fingerprint(&self) -> Result<String, FsError>;

    /// Fingerprint the remote side actually presented on the wire.
    fn remote_fingerprint(&self) -> Result<String, FsError>;

    fn close(&self);
}

/// Factory for peer connections, instantiated with the ICE servers the
/// signaling relay handed out.
pub trait PeerConnector: Send + Sync {
    fn connect(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<PeerEvent>), FsError>;
}

/// Per-label callbacks attached to a session's channels.
pub trait ChannelHandler: Send + Sync {
    fn label(&self) -> &str;

    fn on_open(&self, _channel: Arc<dyn DataChannel>) {}

    fn on_message(&self, _channel: Arc<dyn DataChannel>, _data: &[u8], _is_text: bool) {}

    fn on_close(&self) {}
}

static CONNECTOR: OnceLock<Arc<dyn PeerConnector>> = OnceLock::new();

/// Register the process-wide data-channel stack. The first registration
/// wins; later calls are ignored.
pub fn set_connector(connector: Arc<dyn PeerConnector>) {
    let _ = CONNECTOR.set(connector);
}

/// The registered data-channel stack, if any. The CLI reports a clear
/// error when a command needs one and none was linked in.
pub fn connector() -> Result<Arc<dyn PeerConnector>, FsError> {
    CONNECTOR.get().cloned().ok_or_else(|| {
        FsError::Transport(
            "no peer transport registered; embed one with transport::set_connector".to_string(),
        )
    })
}
