//! Test infrastructure: an in-process signaling relay speaking the room
//! protocol, an in-memory peer transport pair, and a loopback client/server
//! wiring. Session flows run end-to-end without a network or a real
//! data-channel stack.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use peerfs_core::protocol::{FileOperationRequest, FileOperationResult};
use peerfs_core::FsError;
use peerfs_signal::{IceCandidateInit, IceServer};

use crate::client::{FsClient, SendRequest};
use crate::server::{FsServer, ResultWriter};
use crate::transport::{DataChannel, PeerConnector, PeerEvent, PeerState, PeerTransport};
use crate::vfs::Vfs;

// === in-process signaling relay ===

struct RelayPeer {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

type Rooms = Arc<Mutex<HashMap<String, Vec<RelayPeer>>>>;

pub struct TestRelay {
    pub url: String,
}

/// Start a relay on a random local port: `register` is answered with
/// `accept` (`isExistClient` when the room is occupied) and every other
/// frame is forwarded to the other peers in the room.
pub async fn start_relay() -> TestRelay {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
    let addr = listener.local_addr().expect("relay addr");
    let rooms: Rooms = Arc::new(Mutex::new(HashMap::new()));
    let ids = Arc::new(AtomicU64::new(1));

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let rooms = rooms.clone();
            let id = ids.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let _ = serve_relay_client(stream, rooms, id).await;
            });
        }
    });

    TestRelay { url: format!("ws://{}", addr) }
}

async fn serve_relay_client(
    stream: tokio::net::TcpStream,
    rooms: Rooms,
    peer_id: u64,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut stream) = ws.split();

    // first frame must be register
    let room_id = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                let value: serde_json::Value = match serde_json::from_str(&text) {
                    Ok(value) => value,
                    Err(_) => return Ok(()),
                };
                if value["type"] == "register" {
                    break value["roomId"].as_str().unwrap_or_default().to_string();
                }
                return Ok(());
            }
            Some(Ok(_)) => continue,
            _ => return Ok(()),
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let is_exist_client = {
        let mut rooms = rooms.lock();
        let peers = rooms.entry(room_id.clone()).or_default();
        let existed = !peers.is_empty();
        peers.push(RelayPeer { id: peer_id, tx });
        existed
    };

    sink.send(Message::Text(format!(
        "{{\"type\":\"accept\",\"isExistClient\":{},\"iceServers\":[]}}",
        is_exist_client
    )))
    .await?;

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => {
                let rooms = rooms.lock();
                if let Some(peers) = rooms.get(&room_id) {
                    for peer in peers {
                        if peer.id != peer_id {
                            let _ = peer.tx.send(text.clone());
                        }
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    {
        let mut rooms = rooms.lock();
        if let Some(peers) = rooms.get_mut(&room_id) {
            peers.retain(|p| p.id != peer_id);
            if peers.is_empty() {
                rooms.remove(&room_id);
            }
        }
    }
    writer.abort();
    Ok(())
}

// === in-memory peer transport ===

struct Link {
    remote_events: mpsc::UnboundedSender<PeerEvent>,
    labels: Vec<String>,
}

struct OfferRec {
    labels: Vec<String>,
    offerer_events: mpsc::UnboundedSender<PeerEvent>,
    offerer_fp: String,
    offerer_remote_fp: Arc<Mutex<Option<String>>>,
    offerer_link: Arc<Mutex<Option<Link>>>,
}

#[derive(Default)]
pub struct MockNet {
    offers: Mutex<HashMap<String, OfferRec>>,
    next_id: AtomicU64,
}

pub struct MockConnector {
    net: Arc<MockNet>,
}

/// A connector whose transports pair up through a shared registry; the
/// "SDP" is just an offer id.
pub fn mock_connector() -> Arc<dyn PeerConnector> {
    Arc::new(MockConnector { net: Arc::new(MockNet::default()) })
}

impl PeerConnector for MockConnector {
    fn connect(
        &self,
        _ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<PeerEvent>), FsError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.net.next_id.fetch_add(1, Ordering::SeqCst);
        let transport = MockTransport {
            net: self.net.clone(),
            events: tx,
            fingerprint: format!("AA:BB:{:04X}", id),
            declared: Mutex::new(Vec::new()),
            remote_fp: Arc::new(Mutex::new(None)),
            link: Arc::new(Mutex::new(None)),
            closed: AtomicBool::new(false),
        };
        Ok((Arc::new(transport), rx))
    }
}

struct MockTransport {
    net: Arc<MockNet>,
    events: mpsc::UnboundedSender<PeerEvent>,
    fingerprint: String,
    declared: Mutex<Vec<String>>,
    remote_fp: Arc<Mutex<Option<String>>>,
    link: Arc<Mutex<Option<Link>>>,
    closed: AtomicBool,
}

struct MockChannel {
    label: String,
    remote_events: mpsc::UnboundedSender<PeerEvent>,
}

impl DataChannel for MockChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn send_text(&self, text: &str) -> Result<(), FsError> {
        self.remote_events
            .send(PeerEvent::ChannelMessage {
                label: self.label.clone(),
                data: text.as_bytes().to_vec(),
                is_text: true,
            })
            .map_err(|_| FsError::Closed)
    }

    fn send(&self, data: &[u8]) -> Result<(), FsError> {
        self.remote_events
            .send(PeerEvent::ChannelMessage {
                label: self.label.clone(),
                data: data.to_vec(),
                is_text: false,
            })
            .map_err(|_| FsError::Closed)
    }
}

impl PeerTransport for MockTransport {
    fn declare_channel(&self, label: &str) -> Result<(), FsError> {
        self.declared.lock().push(label.to_string());
        Ok(())
    }

    fn create_offer(&self) -> Result<String, FsError> {
        let offer_id = format!("offer-{}", self.net.next_id.fetch_add(1, Ordering::SeqCst));
        self.net.offers.lock().insert(
            offer_id.clone(),
            OfferRec {
                labels: self.declared.lock().clone(),
                offerer_events: self.events.clone(),
                offerer_fp: self.fingerprint.clone(),
                offerer_remote_fp: self.remote_fp.clone(),
                offerer_link: self.link.clone(),
            },
        );
        Ok(offer_id)
    }

    fn accept_offer(&self, sdp: &str) -> Result<String, FsError> {
        let rec = self
            .net
            .offers
            .lock()
            .remove(sdp)
            .ok_or_else(|| FsError::Transport("unknown offer".to_string()))?;

        *self.remote_fp.lock() = Some(rec.offerer_fp.clone());
        *rec.offerer_remote_fp.lock() = Some(self.fingerprint.clone());

        let _ = rec.offerer_events.send(PeerEvent::StateChange(PeerState::Connected));
        let _ = self.events.send(PeerEvent::StateChange(PeerState::Connected));

        for label in &rec.labels {
            let _ = rec.offerer_events.send(PeerEvent::ChannelOpen {
                label: label.clone(),
                channel: Arc::new(MockChannel {
                    label: label.clone(),
                    remote_events: self.events.clone(),
                }),
            });
            let _ = self.events.send(PeerEvent::ChannelOpen {
                label: label.clone(),
                channel: Arc::new(MockChannel {
                    label: label.clone(),
                    remote_events: rec.offerer_events.clone(),
                }),
            });
        }

        *rec.offerer_link.lock() =
            Some(Link { remote_events: self.events.clone(), labels: rec.labels.clone() });
        *self.link.lock() =
            Some(Link { remote_events: rec.offerer_events.clone(), labels: rec.labels });

        Ok(format!("answer-to-{}", sdp))
    }

    fn accept_answer(&self, _sdp: &str) -> Result<(), FsError> {
        Ok(())
    }

    fn add_remote_candidate(&self, _candidate: &IceCandidateInit) -> Result<(), FsError> {
        Ok(())
    }

    fn local_fingerprint(&self) -> Result<String, FsError> {
        Ok(self.fingerprint.clone())
    }

    fn remote_fingerprint(&self) -> Result<String, FsError> {
        self.remote_fp
            .lock()
            .clone()
            .ok_or_else(|| FsError::Transport("no remote fingerprint".to_string()))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(link) = self.link.lock().take() {
            for label in &link.labels {
                let _ = link
                    .remote_events
                    .send(PeerEvent::ChannelClose { label: label.clone() });
            }
            let _ = link.remote_events.send(PeerEvent::StateChange(PeerState::Disconnected));
        }
        let _ = self.events.send(PeerEvent::StateChange(PeerState::Closed));
    }
}

// === loopback client/server ===

/// Wire a client straight into a server, the way a data channel would:
/// requests go in as JSON frames, responses come back through the demux
/// in whichever variant the server picked.
pub fn loopback_client(fsys: Arc<dyn Vfs>) -> FsClient {
    let server = Arc::new(FsServer::new(fsys, 4));
    let cancel = CancellationToken::new();
    let slot: Arc<Mutex<Option<FsClient>>> = Arc::new(Mutex::new(None));

    let demux = slot.clone();
    let send: SendRequest = Arc::new(move |req: &FileOperationRequest| {
        let frame = req.to_json()?;
        let server = server.clone();
        let cancel = cancel.clone();
        let demux = demux.clone();
        tokio::spawn(async move {
            let writer: ResultWriter = Arc::new(move |res: &FileOperationResult| {
                let client = demux.lock().clone().expect("client wired");
                if res.is_json() {
                    client.handle_message(res.to_json()?.as_bytes(), true)
                } else {
                    client.handle_message(&res.to_binary(), false)
                }
            });
            let _ = server.handle_message(&cancel, frame.as_bytes(), true, writer).await;
        });
        Ok(())
    });

    let client = FsClient::new(send);
    *slot.lock() = Some(client.clone());
    client
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect::connect_client;
    use crate::local::LocalFs;
    use crate::publish::{publish_room, run_redirector, CONTROL_EVENT_LABEL};
    use crate::session::PeerSession;
    use crate::thumbnail::init_thumbnailers;
    use crate::transport::ChannelHandler;
    use crate::vfs::ReadOnlyVfs;
    use peerfs_core::control::ControlMessage;
    use peerfs_core::crypto::thumbnail_cache_key;
    use peerfs_core::Config;

    fn test_config(relay: &TestRelay, room: &str, password: &str) -> Config {
        Config {
            signaling_url: relay.url.clone(),
            room_name: room.to_string(),
            password: password.to_string(),
            ..Config::default()
        }
    }

    fn seeded_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hello world").unwrap();
        dir
    }

    // --- loopback RPC ---

    #[tokio::test]
    async fn loopback_write_read_delete_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let client = loopback_client(Arc::new(LocalFs::new(dir.path())));

        let root = client.stat("/").await.unwrap();
        assert!(root.is_dir());
        assert_eq!(root.name, ".");

        let mut file = client.create("test.txt").await.unwrap();
        file.write(b"Hello!").await.unwrap();
        assert_eq!(client.stat("test.txt").await.unwrap().size, 6);

        let data = client.read_file("test.txt").await.unwrap();
        assert_eq!(data, b"Hello!");

        client.truncate("test.txt", 0).await.unwrap();
        assert_eq!(client.stat("test.txt").await.unwrap().size, 0);

        client.rename("test.txt", "test2.txt").await.unwrap();
        assert!(client.stat("test.txt").await.err().unwrap().is_not_found());

        client.remove("test2.txt").await.unwrap();
        assert!(client.stat("test2.txt").await.err().unwrap().is_not_found());

        client.mkdir("newdir").await.unwrap();
        assert!(client.stat("newdir").await.unwrap().is_dir());
        client.remove("newdir").await.unwrap();
    }

    #[tokio::test]
    async fn loopback_chunked_io_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let client = loopback_client(Arc::new(LocalFs::new(dir.path())));

        // spans three max-size request chunks
        let payload: Vec<u8> = (0..150_000usize).map(|i| (i % 251) as u8).collect();
        client.write_file("big.bin", &payload).await.unwrap();
        assert_eq!(client.stat("big.bin").await.unwrap().size, payload.len() as u64);

        let back = client.read_file("big.bin").await.unwrap();
        assert_eq!(back, payload);

        // read at end-of-file yields zero bytes
        let mut file = client.open("big.bin");
        let mut buf = [0u8; 16];
        assert_eq!(file.read_at(&mut buf, payload.len() as u64).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn loopback_readdir_windowing() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..450 {
            std::fs::write(dir.path().join(format!("f{:04}", i)), b"x").unwrap();
        }
        let client = loopback_client(Arc::new(LocalFs::new(dir.path())));

        let entries = client.read_dir("/").await.unwrap();
        assert_eq!(entries.len(), 450);

        let window = client.read_dir_range("/", 400, Some(200)).await.unwrap();
        assert_eq!(window.len(), 50);

        let empty = client.read_dir_range("/", 1000, Some(10)).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn loopback_invalid_and_readonly() {
        let dir = seeded_dir();
        let client = loopback_client(Arc::new(ReadOnlyVfs::new(LocalFs::new(dir.path()))));

        assert!(client.read_dir("../").await.err().unwrap().is_invalid());

        assert!(client.create("x.txt").await.err().unwrap().is_permission());
        assert!(client.truncate("hello.txt", 0).await.err().unwrap().is_permission());
        assert!(client.remove("hello.txt").await.err().unwrap().is_permission());
        assert!(client.rename("hello.txt", "b").await.err().unwrap().is_permission());
        assert!(client.mkdir("d").await.err().unwrap().is_permission());

        let mut writer = client.open("hello.txt");
        assert!(writer.write(b"denied").await.err().unwrap().is_permission());

        // reads still flow
        assert_eq!(client.read_file("hello.txt").await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn loopback_thumbnail_pseudo_path() {
        let dir = tempfile::tempdir().unwrap();
        let img = image::RgbImage::from_pixel(320, 240, image::Rgb([10u8, 200, 50]));
        img.save(dir.path().join("photo.png")).unwrap();

        let cache = tempfile::tempdir().unwrap();
        let config = Config {
            thumbnail_cache_dir: cache.path().to_string_lossy().into_owned(),
            ..Config::default()
        };
        init_thumbnailers(&config);

        let client = loopback_client(Arc::new(LocalFs::new(dir.path())));

        let mut a = client.open("photo.png#thumbnail.jpeg");
        let mut b = client.open("photo.png#thumbnail.jpeg");
        let mut buf_a = vec![0u8; 1024];
        let mut buf_b = vec![0u8; 1024];
        let (ra, rb) = tokio::join!(a.read_at(&mut buf_a, 0), b.read_at(&mut buf_b, 0));
        let (na, nb) = (ra.unwrap(), rb.unwrap());
        assert!(na > 0);
        assert_eq!(buf_a[..2], [0xFF, 0xD8]);
        assert_eq!(buf_a[..na.min(nb)], buf_b[..na.min(nb)]);

        // both see the same content-addressed cache file
        let cache_file = std::path::Path::new(&config.thumbnail_cache_dir)
            .join(format!("{}.jpeg", thumbnail_cache_key("photo.png")));
        assert!(cache_file.exists());
    }

    // --- end-to-end sessions over relay + mock transport ---

    #[tokio::test]
    async fn session_auth_success_and_file_ops() {
        let relay = start_relay().await;
        let connector = mock_connector();
        let dir = seeded_dir();
        let config = test_config(&relay, "e2e-ok", "s3cret");

        let fsys: Arc<dyn Vfs> = Arc::new(ReadOnlyVfs::new(LocalFs::new(dir.path())));
        let publisher = {
            let config = config.clone();
            let connector = connector.clone();
            tokio::spawn(async move {
                publish_room(&config, &connector, &config.room_id(), fsys).await
            })
        };
        // let the publisher take the room first
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let session = connect_client(&config, &connector).await.unwrap();
        let client = &session.client;

        let root = client.stat("/").await.unwrap();
        assert!(root.is_dir());

        let entries = client.read_dir("/").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "hello.txt");
        assert!(!entries[0].writable);

        assert_eq!(client.read_file("/hello.txt").await.unwrap(), b"hello world");
        assert!(client.remove("/hello.txt").await.err().unwrap().is_permission());

        session.close();
        publisher.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn session_auth_failure_closes() {
        let relay = start_relay().await;
        let connector = mock_connector();
        let dir = seeded_dir();
        let server_config = test_config(&relay, "e2e-bad", "s3cret");
        let client_config = test_config(&relay, "e2e-bad", "wrong");

        let fsys: Arc<dyn Vfs> = Arc::new(ReadOnlyVfs::new(LocalFs::new(dir.path())));
        let publisher = {
            let config = server_config.clone();
            let connector = connector.clone();
            tokio::spawn(async move {
                publish_room(&config, &connector, &config.room_id(), fsys).await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let err = connect_client(&client_config, &connector).await.err().unwrap();
        assert!(matches!(err.root(), FsError::AuthFailed));
        publisher.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn session_redirect_then_connect() {
        let relay = start_relay().await;
        let connector = mock_connector();
        let dir = seeded_dir();
        let config = test_config(&relay, "e2e-redirect", "s3cret");

        let fsys: Arc<dyn Vfs> = Arc::new(ReadOnlyVfs::new(LocalFs::new(dir.path())));
        let _redirector = {
            let config = config.clone();
            let connector = connector.clone();
            tokio::spawn(async move { run_redirector(&config, &connector, fsys).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let session = connect_client(&config, &connector).await.unwrap();
        assert_eq!(session.client.read_file("/hello.txt").await.unwrap(), b"hello world");
        session.close();
    }

    /// A control handler that answers every visitor with a redirect back
    /// to the same room, never handing out a real publisher.
    struct AlwaysRedirect {
        target: String,
    }

    impl ChannelHandler for AlwaysRedirect {
        fn label(&self) -> &str {
            CONTROL_EVENT_LABEL
        }

        fn on_open(&self, channel: Arc<dyn DataChannel>) {
            let msg = ControlMessage::Redirect { room_id: self.target.clone() };
            let _ = channel.send_text(&msg.to_json().unwrap());
        }
    }

    #[tokio::test]
    async fn session_redirect_loop_detected() {
        let relay = start_relay().await;
        let connector = mock_connector();
        let config = test_config(&relay, "e2e-loop", "");

        // a malicious endpoint that sends every visitor back to the same
        // room, forever
        let stable = config.room_id();
        let _malicious = {
            let url = config.signaling_url.clone();
            let connector = connector.clone();
            let stable = stable.clone();
            tokio::spawn(async move {
                loop {
                    let session = match PeerSession::connect(&url, &stable, "", &connector).await
                    {
                        Ok(session) => session,
                        Err(_) => return,
                    };
                    let handler: Arc<dyn ChannelHandler> =
                        Arc::new(AlwaysRedirect { target: stable.clone() });
                    if session.start(vec![handler]).await.is_err() {
                        return;
                    }
                    let _ = session.wait().await;
                }
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let err = connect_client(&config, &connector).await.err().unwrap();
        assert!(matches!(err.root(), FsError::RedirectLoop));
    }
}
