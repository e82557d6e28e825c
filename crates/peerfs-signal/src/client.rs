//! Signaling connection
//!
//! Dials the relay, registers into a room, then pumps the signaling
//! stream: keep-alives are answered in place, `bye` tears the connection
//! down, and `offer` / `answer` / `candidate` are handed to the consumer.
//!
//! Locally gathered ICE candidates are buffered until the first remote
//! `offer` or `answer` has been seen, then flushed in order; afterwards
//! each candidate is relayed immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::messages::{AuthResult, IceCandidateInit, SignalingMessage};

/// Timeout for dialing and for the register handshake.
const WS_TIMEOUT: Duration = Duration::from_secs(30);

/// Frames the peer-connection layer consumes.
#[derive(Clone, Debug)]
pub enum PeerSignal {
    Offer(String),
    Answer(String),
    Candidate(IceCandidateInit),
}

#[derive(Clone, Debug, Error)]
pub enum SignalError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("rejected by relay: {0}")]
    Rejected(String),

    #[error("socket error: {0}")]
    Socket(String),

    #[error("connection closed")]
    Closed,

    #[error("timeout")]
    Timeout,
}

/// Frames arriving from the socket; the pump reports read failures in-band.
pub type SocketRx = mpsc::Receiver<Result<String, SignalError>>;

struct Shared {
    ready: AtomicBool,
    pending: Mutex<Vec<IceCandidateInit>>,
    closed: AtomicBool,
    done_tx: watch::Sender<bool>,
    last_error: Mutex<Option<SignalError>>,
}

impl Shared {
    fn shut_down(&self, err: Option<SignalError>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(err) = err {
            let mut slot = self.last_error.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        let _ = self.done_tx.send(true);
    }
}

/// A registered signaling connection.
pub struct SignalingConn {
    out_tx: Mutex<Option<mpsc::Sender<String>>>,
    auth: AuthResult,
    shared: Arc<Shared>,
}

impl SignalingConn {
    /// Dial the relay and register into `room_id`. Returns the connection
    /// and the stream of peer frames (`offer` / `answer` / `candidate`).
    pub async fn dial(
        url: &str,
        room_id: &str,
        signaling_key: &str,
    ) -> Result<(Self, mpsc::Receiver<PeerSignal>), SignalError> {
        let parsed = Url::parse(url).map_err(|e| SignalError::Connect(e.to_string()))?;
        debug!("dialing signaling relay {}", parsed);

        let (ws, _response) = timeout(WS_TIMEOUT, connect_async(parsed.as_str()))
            .await
            .map_err(|_| SignalError::Timeout)?
            .map_err(|e| SignalError::Connect(e.to_string()))?;

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(32);
        let (in_tx, in_rx) = mpsc::channel::<Result<String, SignalError>>(32);

        // Writer pump: ends when every sender is gone, then closes the socket.
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!("signaling write failed: {}", e);
                    return;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        });

        // Reader pump: read failures are forwarded in-band.
        tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(Ok(text)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        let _ = in_tx.send(Err(SignalError::Socket(e.to_string()))).await;
                        return;
                    }
                }
            }
        });

        Self::start(out_tx, in_rx, room_id, signaling_key).await
    }

    /// Register over an already-established socket pair. `dial` wires a
    /// real WebSocket to this; tests drive it with plain channels.
    pub async fn start(
        out_tx: mpsc::Sender<String>,
        mut sock_rx: SocketRx,
        room_id: &str,
        signaling_key: &str,
    ) -> Result<(Self, mpsc::Receiver<PeerSignal>), SignalError> {
        let register = SignalingMessage::Register {
            room_id: room_id.to_string(),
            client_id: None,
            authn_metadata: None,
            signaling_key: if signaling_key.is_empty() {
                None
            } else {
                Some(signaling_key.to_string())
            },
        };
        let json = register.to_json().map_err(|e| SignalError::Socket(e.to_string()))?;
        out_tx.send(json).await.map_err(|_| SignalError::Closed)?;

        let first = timeout(WS_TIMEOUT, sock_rx.recv())
            .await
            .map_err(|_| SignalError::Timeout)?
            .ok_or(SignalError::Closed)??;
        let auth = match SignalingMessage::from_json(&first)
            .map_err(|e| SignalError::Socket(e.to_string()))?
        {
            SignalingMessage::Accept { is_exist_client, ice_servers, .. } => AuthResult {
                is_exist_client,
                ice_servers: ice_servers.unwrap_or_default(),
            },
            SignalingMessage::Reject { reason } => {
                return Err(SignalError::Rejected(reason.unwrap_or_else(|| "rejected".into())))
            }
            other => {
                return Err(SignalError::Socket(format!(
                    "unexpected reply to register: {:?}",
                    other
                )))
            }
        };

        let (done_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            ready: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            done_tx,
            last_error: Mutex::new(None),
        });

        let (peer_tx, peer_rx) = mpsc::channel::<PeerSignal>(32);
        tokio::spawn(recv_loop(sock_rx, out_tx.clone(), peer_tx, shared.clone()));

        let conn = SignalingConn { out_tx: Mutex::new(Some(out_tx)), auth, shared };
        Ok((conn, peer_rx))
    }

    /// True when a peer was already waiting in the room; the local side
    /// then acts as the offerer.
    pub fn is_exist_client(&self) -> bool {
        self.auth.is_exist_client
    }

    pub fn ice_servers(&self) -> &[crate::messages::IceServer] {
        &self.auth.ice_servers
    }

    pub async fn send_offer(&self, sdp: String) -> Result<(), SignalError> {
        self.send(&SignalingMessage::Offer { sdp }).await
    }

    pub async fn send_answer(&self, sdp: String) -> Result<(), SignalError> {
        self.send(&SignalingMessage::Answer { sdp }).await
    }

    /// Relay a locally gathered candidate, or queue it while the remote
    /// description has not been seen yet.
    pub async fn send_candidate(&self, ice: IceCandidateInit) -> Result<(), SignalError> {
        {
            let mut pending = self.shared.pending.lock();
            if !self.shared.ready.load(Ordering::SeqCst) {
                pending.push(ice);
                return Ok(());
            }
        }
        self.send(&SignalingMessage::Candidate { ice }).await
    }

    async fn send(&self, msg: &SignalingMessage) -> Result<(), SignalError> {
        let tx = self.out_tx.lock().clone().ok_or(SignalError::Closed)?;
        let json = msg.to_json().map_err(|e| SignalError::Socket(e.to_string()))?;
        tx.send(json).await.map_err(|_| SignalError::Closed)
    }

    /// Idempotent teardown: drops the socket writer and resolves `wait`.
    pub fn close(&self) {
        self.out_tx.lock().take();
        self.shared.shut_down(None);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Resolves when the connection is torn down, by either side.
    pub async fn wait(&self) {
        let mut done = self.shared.done_tx.subscribe();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn last_error(&self) -> Option<SignalError> {
        self.shared.last_error.lock().clone()
    }
}

impl Drop for SignalingConn {
    fn drop(&mut self) {
        self.shared.shut_down(None);
    }
}

async fn recv_loop(
    mut sock_rx: SocketRx,
    out_tx: mpsc::Sender<String>,
    peer_tx: mpsc::Sender<PeerSignal>,
    shared: Arc<Shared>,
) {
    let mut done = shared.done_tx.subscribe();
    let err = loop {
        let next = tokio::select! {
            _ = done.wait_for(|closed| *closed) => break None,
            next = sock_rx.recv() => next,
        };
        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => break Some(e),
            None => break Some(SignalError::Closed),
        };
        if shared.closed.load(Ordering::SeqCst) {
            break None;
        }
        let msg = match SignalingMessage::from_json(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("bad signaling frame: {}", e);
                break Some(SignalError::Socket(e.to_string()));
            }
        };
        match msg {
            SignalingMessage::Ping => {
                let pong = SignalingMessage::Pong.to_json().expect("pong serializes");
                if out_tx.send(pong).await.is_err() {
                    break Some(SignalError::Closed);
                }
            }
            SignalingMessage::Pong => {}
            SignalingMessage::Bye => break None,
            SignalingMessage::Offer { sdp } => {
                if peer_tx.send(PeerSignal::Offer(sdp)).await.is_err() {
                    break None;
                }
                flush_candidates(&shared, &out_tx).await;
            }
            SignalingMessage::Answer { sdp } => {
                if peer_tx.send(PeerSignal::Answer(sdp)).await.is_err() {
                    break None;
                }
                flush_candidates(&shared, &out_tx).await;
            }
            SignalingMessage::Candidate { ice } => {
                if peer_tx.send(PeerSignal::Candidate(ice)).await.is_err() {
                    break None;
                }
            }
            other => {
                debug!("unknown signaling message: {:?}", other);
            }
        }
    };
    shared.shut_down(err);
}

/// The remote description has been seen: flip the ready flag and relay
/// everything queued, in gathering order.
async fn flush_candidates(shared: &Shared, out_tx: &mpsc::Sender<String>) {
    let drained = {
        let mut pending = shared.pending.lock();
        shared.ready.store(true, Ordering::SeqCst);
        std::mem::take(&mut *pending)
    };
    for ice in drained {
        let msg = SignalingMessage::Candidate { ice };
        let json = msg.to_json().expect("candidate serializes");
        if out_tx.send(json).await.is_err() {
            return;
        }
    }
}
