//! Session orchestrator
//!
//! Wires a signaling connection to a peer transport: role selection,
//! SDP/ICE forwarding, channel dispatch by label, and teardown on any
//! fatal state. The signaling side buffers outgoing candidates until the
//! remote description is seen; this loop only moves frames.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use peerfs_core::FsError;
use peerfs_signal::{PeerSignal, SignalError, SignalingConn};

use crate::transport::{ChannelHandler, DataChannel, PeerConnector, PeerEvent, PeerTransport};

pub struct PeerSession {
    signaling: SignalingConn,
    peer: Arc<dyn PeerTransport>,
    sig_rx: Mutex<Option<mpsc::Receiver<PeerSignal>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    cancel: CancellationToken,
    last_error: Mutex<Option<FsError>>,
}

impl PeerSession {
    /// Dial the relay, register into `room_id`, and instantiate a peer
    /// connection with the ICE servers the relay handed out.
    pub async fn connect(
        url: &str,
        room_id: &str,
        signaling_key: &str,
        connector: &Arc<dyn PeerConnector>,
    ) -> Result<Arc<Self>, FsError> {
        let (signaling, sig_rx) = SignalingConn::dial(url, room_id, signaling_key)
            .await
            .map_err(signal_err)?;
        Self::with_connection(signaling, sig_rx, connector)
    }

    /// Build a session over an already-registered signaling connection.
    pub fn with_connection(
        signaling: SignalingConn,
        sig_rx: mpsc::Receiver<PeerSignal>,
        connector: &Arc<dyn PeerConnector>,
    ) -> Result<Arc<Self>, FsError> {
        let (peer, events_rx) = match connector.connect(signaling.ice_servers()) {
            Ok(pair) => pair,
            Err(err) => {
                signaling.close();
                return Err(err);
            }
        };
        Ok(Arc::new(Self {
            signaling,
            peer,
            sig_rx: Mutex::new(Some(sig_rx)),
            events_rx: Mutex::new(Some(events_rx)),
            cancel: CancellationToken::new(),
            last_error: Mutex::new(None),
        }))
    }

    /// True when a peer was already waiting in the room; the local side
    /// is then the offerer and pre-creates its channels.
    pub fn is_exist_client(&self) -> bool {
        self.signaling.is_exist_client()
    }

    pub fn local_fingerprint(&self) -> Result<String, FsError> {
        self.peer.local_fingerprint()
    }

    pub fn remote_fingerprint(&self) -> Result<String, FsError> {
        self.peer.remote_fingerprint()
    }

    /// Session-scoped cancellation; in-flight server work hangs off this.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start the session: the offerer declares its channels and sends the
    /// offer, then the forwarding loop runs until either layer dies.
    pub async fn start(
        self: &Arc<Self>,
        handlers: Vec<Arc<dyn ChannelHandler>>,
    ) -> Result<(), FsError> {
        let sig_rx = self
            .sig_rx
            .lock()
            .take()
            .ok_or_else(|| FsError::Other("session already started".to_string()))?;
        let events_rx = self.events_rx.lock().take().expect("receivers taken together");

        if self.signaling.is_exist_client() {
            for handler in &handlers {
                self.peer.declare_channel(handler.label())?;
            }
            let offer = self.peer.create_offer()?;
            self.signaling.send_offer(offer).await.map_err(signal_err)?;
        }

        let session = self.clone();
        tokio::spawn(run_loop(session, sig_rx, events_rx, handlers));
        Ok(())
    }

    /// Resolves when the session has torn down; the first caller receives
    /// the terminal error, if any.
    pub async fn wait(&self) -> Result<(), FsError> {
        self.cancel.cancelled().await;
        match self.last_error.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn close(&self) {
        self.teardown();
    }

    fn teardown(&self) {
        self.peer.close();
        self.signaling.close();
        self.cancel.cancel();
    }

    fn record_error(&self, err: FsError) {
        let mut slot = self.last_error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }
}

async fn run_loop(
    session: Arc<PeerSession>,
    mut sig_rx: mpsc::Receiver<PeerSignal>,
    mut events_rx: mpsc::UnboundedReceiver<PeerEvent>,
    handlers: Vec<Arc<dyn ChannelHandler>>,
) {
    let mut channels: HashMap<String, Arc<dyn DataChannel>> = HashMap::new();
    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => break,

            sig = sig_rx.recv() => match sig {
                Some(PeerSignal::Offer(sdp)) => match session.peer.accept_offer(&sdp) {
                    Ok(answer) => {
                        if let Err(err) = session.signaling.send_answer(answer).await {
                            session.record_error(signal_err(err));
                            break;
                        }
                    }
                    Err(err) => {
                        session.record_error(err);
                        break;
                    }
                },
                Some(PeerSignal::Answer(sdp)) => {
                    if let Err(err) = session.peer.accept_answer(&sdp) {
                        session.record_error(err);
                        break;
                    }
                }
                Some(PeerSignal::Candidate(ice)) => {
                    if let Err(err) = session.peer.add_remote_candidate(&ice) {
                        warn!("remote candidate rejected: {}", err);
                    }
                }
                None => {
                    if let Some(err) = session.signaling.last_error() {
                        session.record_error(signal_err(err));
                    }
                    break;
                }
            },

            event = events_rx.recv() => match event {
                Some(PeerEvent::IceCandidate(ice)) => {
                    let _ = session.signaling.send_candidate(ice).await;
                }
                Some(PeerEvent::StateChange(state)) => {
                    info!("peer connection state: {:?}", state);
                    if state.is_fatal() {
                        session.signaling.close();
                    }
                }
                Some(PeerEvent::ChannelOpen { label, channel }) => {
                    channels.insert(label.clone(), channel.clone());
                    if let Some(handler) = handler_for(&handlers, &label) {
                        handler.on_open(channel);
                    } else {
                        debug!("unhandled channel open: {}", label);
                    }
                }
                Some(PeerEvent::ChannelMessage { label, data, is_text }) => {
                    if let (Some(handler), Some(channel)) =
                        (handler_for(&handlers, &label), channels.get(&label))
                    {
                        handler.on_message(channel.clone(), &data, is_text);
                    }
                }
                Some(PeerEvent::ChannelClose { label }) => {
                    channels.remove(&label);
                    if let Some(handler) = handler_for(&handlers, &label) {
                        handler.on_close();
                    }
                }
                None => break,
            },
        }
    }
    session.teardown();
}

fn handler_for<'a>(
    handlers: &'a [Arc<dyn ChannelHandler>],
    label: &str,
) -> Option<&'a Arc<dyn ChannelHandler>> {
    handlers.iter().find(|h| h.label() == label)
}

fn signal_err(err: SignalError) -> FsError {
    match err {
        SignalError::Rejected(reason) => FsError::Other(format!("signaling rejected: {}", reason)),
        SignalError::Timeout => FsError::Timeout,
        SignalError::Closed => FsError::Closed,
        other => FsError::Transport(other.to_string()),
    }
}
