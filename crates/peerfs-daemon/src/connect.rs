//! Client connector
//!
//! Joins a room, builds the RPC client over the `fileServer` channel,
//! authenticates on `controlEvent`, and follows `redirect` frames up to a
//! bounded depth.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use peerfs_core::control::ControlMessage;
use peerfs_core::crypto::auth_hmac;
use peerfs_core::protocol::FileOperationRequest;
use peerfs_core::{Config, FsError, MAX_REDIRECT};

use crate::client::FsClient;
use crate::publish::{CONTROL_EVENT_LABEL, FILE_SERVER_LABEL};
use crate::session::PeerSession;
use crate::transport::{ChannelHandler, DataChannel, PeerConnector};

/// A connected, authenticated client session.
pub struct ClientSession {
    pub session: Arc<PeerSession>,
    pub client: FsClient,
}

impl ClientSession {
    pub fn close(&self) {
        self.client.abort();
        self.session.close();
    }
}

enum Event {
    ClientReady,
    Auth { result: bool, has_file: bool },
    Redirect(String),
}

enum Outcome {
    Connected(ClientSession),
    Redirect(String),
}

/// Connect to the configured room, following redirects. The fourth
/// redirect in a row fails with `RedirectLoop`.
pub async fn connect_client(
    config: &Config,
    connector: &Arc<dyn PeerConnector>,
) -> Result<ClientSession, FsError> {
    let mut room_id = config.room_id();
    for _ in 0..=MAX_REDIRECT {
        match connect_room(config, connector, &room_id).await? {
            Outcome::Connected(session) => return Ok(session),
            Outcome::Redirect(next) => {
                info!("redirect to roomId: {}", next);
                room_id = next;
            }
        }
    }
    Err(FsError::RedirectLoop)
}

async fn connect_room(
    config: &Config,
    connector: &Arc<dyn PeerConnector>,
    room_id: &str,
) -> Result<Outcome, FsError> {
    info!("waiting for connect: {}", room_id);
    let session = PeerSession::connect(
        &config.signaling_url,
        room_id,
        &config.signaling_key,
        connector,
    )
    .await?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();
    let client_slot: Arc<Mutex<Option<FsClient>>> = Arc::new(Mutex::new(None));

    let handlers: Vec<Arc<dyn ChannelHandler>> = vec![
        Arc::new(FileChannelHandler { slot: client_slot.clone(), event_tx: event_tx.clone() }),
        Arc::new(ControlClientHandler {
            session: session.clone(),
            password: config.password.clone(),
            event_tx: event_tx.clone(),
        }),
    ];
    drop(event_tx);
    session.start(handlers).await?;

    // An auth verdict needs the RPC channel up before the session is
    // usable; a redirect is decisive on its own (a redirector may never
    // open the RPC channel).
    let mut verdict: Option<Event> = None;
    let mut client_ready = false;
    loop {
        match &verdict {
            Some(Event::Redirect(_)) => break,
            Some(Event::Auth { .. }) if client_ready => break,
            _ => {}
        }
        match event_rx.recv().await {
            Some(Event::ClientReady) => client_ready = true,
            Some(event) => verdict = Some(event),
            None => {
                session.close();
                return Err(FsError::Transport("session ended during handshake".to_string()));
            }
        }
    }

    match verdict.expect("loop exits with a verdict") {
        Event::Redirect(next) => {
            session.close();
            Ok(Outcome::Redirect(next))
        }
        Event::Auth { result, has_file } => {
            if !has_file {
                session.close();
                return Err(FsError::Other("no file service".to_string()));
            }
            if !result {
                session.close();
                return Err(FsError::AuthFailed);
            }
            info!("connected");
            let client = client_slot.lock().clone().expect("client ready");
            Ok(Outcome::Connected(ClientSession { session, client }))
        }
        Event::ClientReady => unreachable!("verdict never holds ClientReady"),
    }
}

/// Builds the RPC client when the channel opens and feeds replies into
/// its demultiplexer.
struct FileChannelHandler {
    slot: Arc<Mutex<Option<FsClient>>>,
    event_tx: mpsc::UnboundedSender<Event>,
}

impl ChannelHandler for FileChannelHandler {
    fn label(&self) -> &str {
        FILE_SERVER_LABEL
    }

    fn on_open(&self, channel: Arc<dyn DataChannel>) {
        let client = FsClient::new(Arc::new(move |req: &FileOperationRequest| {
            channel.send_text(&req.to_json()?)
        }));
        *self.slot.lock() = Some(client);
        let _ = self.event_tx.send(Event::ClientReady);
    }

    fn on_message(&self, _channel: Arc<dyn DataChannel>, data: &[u8], is_text: bool) {
        let client = self.slot.lock().clone();
        if let Some(client) = client {
            if let Err(err) = client.handle_message(data, is_text) {
                warn!("bad rpc reply: {}", err);
            }
        }
    }

    fn on_close(&self) {
        if let Some(client) = self.slot.lock().clone() {
            client.abort();
        }
    }
}

/// Sends the fingerprint-bound credential on open and reports the
/// server's verdict or a redirect.
struct ControlClientHandler {
    session: Arc<PeerSession>,
    password: String,
    event_tx: mpsc::UnboundedSender<Event>,
}

impl ChannelHandler for ControlClientHandler {
    fn label(&self) -> &str {
        CONTROL_EVENT_LABEL
    }

    fn on_open(&self, channel: Arc<dyn DataChannel>) {
        let fingerprint = match self.session.local_fingerprint() {
            Ok(fp) => fp,
            Err(err) => {
                warn!("no local fingerprint: {}", err);
                String::new()
            }
        };
        let msg = ControlMessage::Auth {
            hmac: auth_hmac(&self.password, &fingerprint).to_vec(),
            fingerprint,
        };
        if let Ok(json) = msg.to_json() {
            let _ = channel.send_text(&json);
        }
    }

    fn on_message(&self, _channel: Arc<dyn DataChannel>, data: &[u8], _is_text: bool) {
        match ControlMessage::from_json(data) {
            Ok(ControlMessage::AuthResult { result, services }) => {
                let has_file =
                    services.map(|s| s.contains_key("file")).unwrap_or(true);
                let _ = self.event_tx.send(Event::Auth { result, has_file });
            }
            Ok(ControlMessage::Redirect { room_id }) => {
                let _ = self.event_tx.send(Event::Redirect(room_id));
            }
            _ => {}
        }
    }
}
