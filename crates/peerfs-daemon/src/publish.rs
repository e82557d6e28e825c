//! Publisher and redirector
//!
//! A publisher session exposes the RPC server on the `fileServer` channel
//! and answers `auth` frames on `controlEvent`; until a valid credential
//! arrives, RPC frames are answered with an auth error. The redirector
//! listens on the stable room and hands each visitor a fresh room served
//! by a dedicated publish worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use peerfs_core::control::ControlMessage;
use peerfs_core::crypto::{random_room_suffix, verify_auth_hmac, ROOM_SUFFIX_LEN};
use peerfs_core::protocol::{FileOperationResult, FsCapability};
use peerfs_core::{Config, FsError, DEFAULT_PARALLELISM};

use crate::server::{FsServer, ResultWriter};
use crate::session::PeerSession;
use crate::transport::{ChannelHandler, DataChannel, PeerConnector};
use crate::vfs::Vfs;

/// Label of the RPC channel.
pub const FILE_SERVER_LABEL: &str = "fileServer";
/// Label of the control/redirect channel.
pub const CONTROL_EVENT_LABEL: &str = "controlEvent";

/// How long a redirector session lingers after handing out a room.
const REDIRECT_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Delay between redirector sessions.
const REDIRECTOR_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Frame a server result for the channel, picking the variant by content.
fn channel_writer(channel: Arc<dyn DataChannel>) -> ResultWriter {
    Arc::new(move |res: &FileOperationResult| {
        if res.is_json() {
            channel.send_text(&res.to_json()?)
        } else {
            channel.send(&res.to_binary())
        }
    })
}

/// Serves RPC frames once the session is authorized.
struct FileServerHandler {
    server: Arc<FsServer>,
    authorized: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl ChannelHandler for FileServerHandler {
    fn label(&self) -> &str {
        FILE_SERVER_LABEL
    }

    fn on_message(&self, channel: Arc<dyn DataChannel>, data: &[u8], is_text: bool) {
        let writer = channel_writer(channel);
        if !self.authorized.load(Ordering::SeqCst) {
            if let Err(err) = self.server.error_reply(data, is_text, &writer, "auth error") {
                warn!("auth error reply failed: {}", err);
            }
            return;
        }
        let server = self.server.clone();
        let cancel = self.cancel.clone();
        let data = data.to_vec();
        tokio::spawn(async move {
            if let Err(err) = server.handle_message(&cancel, &data, is_text, writer).await {
                warn!("rpc frame rejected: {}", err);
            }
        });
    }
}

/// Validates `auth` frames: the declared fingerprint must match what the
/// transport actually saw from the remote side, then the HMAC must verify
/// in constant time. Success latches the session authorized.
struct ControlAuthHandler {
    session: Arc<PeerSession>,
    password: String,
    authorized: Arc<AtomicBool>,
    caps: FsCapability,
}

impl ChannelHandler for ControlAuthHandler {
    fn label(&self) -> &str {
        CONTROL_EVENT_LABEL
    }

    fn on_message(&self, channel: Arc<dyn DataChannel>, data: &[u8], _is_text: bool) {
        let msg = match ControlMessage::from_json(data) {
            Ok(msg) => msg,
            Err(_) => return,
        };
        let (fingerprint, hmac) = match msg {
            ControlMessage::Auth { fingerprint, hmac } => (fingerprint, hmac),
            _ => return,
        };

        if !hmac.is_empty() {
            match self.session.remote_fingerprint() {
                Ok(remote) if remote.eq_ignore_ascii_case(&fingerprint) => {
                    if verify_auth_hmac(&self.password, &fingerprint, &hmac) {
                        self.authorized.store(true, Ordering::SeqCst);
                    }
                }
                _ => {
                    // Broken client or MITM
                    warn!("fingerprint error: {}", fingerprint);
                }
            }
        }
        let authorized = self.authorized.load(Ordering::SeqCst);
        info!("auth result: {}", authorized);

        let mut services = HashMap::new();
        services.insert("file".to_string(), self.caps);
        let reply = ControlMessage::AuthResult { result: authorized, services: Some(services) };
        if let Ok(json) = reply.to_json() {
            let _ = channel.send_text(&json);
        }
    }
}

/// Publish `fsys` on one room until the session ends.
pub async fn publish_room(
    config: &Config,
    connector: &Arc<dyn PeerConnector>,
    room_id: &str,
    fsys: Arc<dyn Vfs>,
) -> Result<(), FsError> {
    info!("waiting for connect: {}", room_id);
    let authorized = Arc::new(AtomicBool::new(config.password.is_empty()));
    let server = Arc::new(FsServer::new(fsys, DEFAULT_PARALLELISM));
    let caps = server.capability();

    let session = PeerSession::connect(
        &config.signaling_url,
        room_id,
        &config.signaling_key,
        connector,
    )
    .await?;

    let handlers: Vec<Arc<dyn ChannelHandler>> = vec![
        Arc::new(FileServerHandler {
            server,
            authorized: authorized.clone(),
            cancel: session.cancellation(),
        }),
        Arc::new(ControlAuthHandler {
            session: session.clone(),
            password: config.password.clone(),
            authorized,
            caps,
        }),
    ];
    session.start(handlers).await?;
    let result = session.wait().await;
    session.close();
    result
}

/// Publish on the stable room id.
pub async fn publish(
    config: &Config,
    connector: &Arc<dyn PeerConnector>,
    fsys: Arc<dyn Vfs>,
) -> Result<(), FsError> {
    publish_room(config, connector, &config.room_id(), fsys).await
}

/// Hands out a fresh room on every visit, then closes after a short
/// grace period so the next client gets its own session.
struct RedirectorHandler {
    session: Arc<PeerSession>,
    config: Config,
    connector: Arc<dyn PeerConnector>,
    fsys: Arc<dyn Vfs>,
}

impl ChannelHandler for RedirectorHandler {
    fn label(&self) -> &str {
        CONTROL_EVENT_LABEL
    }

    fn on_open(&self, channel: Arc<dyn DataChannel>) {
        let room_id =
            format!("{}.{}", self.config.room_id(), random_room_suffix(ROOM_SUFFIX_LEN));
        info!("redirecting client to {}", room_id);

        let config = self.config.clone();
        let connector = self.connector.clone();
        let fsys = self.fsys.clone();
        let worker_room = room_id.clone();
        tokio::spawn(async move {
            if let Err(err) = publish_room(&config, &connector, &worker_room, fsys).await {
                error!("publish worker on {} failed: {}", worker_room, err);
            }
        });

        let msg = ControlMessage::Redirect { room_id };
        if let Ok(json) = msg.to_json() {
            let _ = channel.send_text(&json);
        }

        let session = self.session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(REDIRECT_CLOSE_GRACE).await;
            session.close();
        });
    }
}

/// Run the redirector on the stable room, forever. Each accepted client
/// is pointed at a dedicated room with its own publish worker.
pub async fn run_redirector(
    config: &Config,
    connector: &Arc<dyn PeerConnector>,
    fsys: Arc<dyn Vfs>,
) -> Result<(), FsError> {
    loop {
        let session = PeerSession::connect(
            &config.signaling_url,
            &config.room_id(),
            &config.signaling_key,
            connector,
        )
        .await?;

        let handler: Arc<dyn ChannelHandler> = Arc::new(RedirectorHandler {
            session: session.clone(),
            config: config.clone(),
            connector: connector.clone(),
            fsys: fsys.clone(),
        });
        session.start(vec![handler]).await?;
        if let Err(err) = session.wait().await {
            warn!("redirector session ended: {}", err);
        }
        tokio::time::sleep(REDIRECTOR_RESTART_DELAY).await;
    }
}
