//! Pairing
//!
//! One-shot bootstrap: generate a PIN, wait in the pairing room, hand the
//! first visitor the credentials for the real room over a dedicated
//! channel, then close.

use std::sync::Arc;

use tracing::info;

use peerfs_core::control::ControlMessage;
use peerfs_core::crypto::pairing_pin;
use peerfs_core::{Config, FsError};

use crate::session::PeerSession;
use crate::transport::{ChannelHandler, DataChannel, PeerConnector};

const SECRET_EXCHANGE_LABEL: &str = "secretExchange";

/// Run one pairing exchange, bounded by the configured timeout.
pub async fn pairing(config: &Config, connector: &Arc<dyn PeerConnector>) -> Result<(), FsError> {
    let pin = pairing_pin();
    info!("PIN: {}", pin);

    let session = PeerSession::connect(
        &config.signaling_url,
        &config.pairing_room_id(&pin),
        &config.signaling_key,
        connector,
    )
    .await?;

    if session.is_exist_client() {
        session.close();
        return Err(FsError::Other("room already used".to_string()));
    }

    let handler: Arc<dyn ChannelHandler> = Arc::new(SecretExchangeHandler {
        session: session.clone(),
        hello: ControlMessage::Hello {
            room_id: config.room_id(),
            signaling_key: config.signaling_key.clone(),
            token: config.password.clone(),
            name: config.room_name.clone(),
            user_agent: "peerfs".to_string(),
            services: vec!["file".to_string(), "no-client".to_string()],
            version: 1,
        },
    });
    session.start(vec![handler]).await?;

    let timeout = std::time::Duration::from_secs(config.pairing_timeout_secs);
    let result = tokio::time::timeout(timeout, session.wait()).await;
    session.close();
    match result {
        Ok(outcome) => outcome,
        Err(_) => Err(FsError::Timeout),
    }
}

struct SecretExchangeHandler {
    session: Arc<PeerSession>,
    hello: ControlMessage,
}

impl ChannelHandler for SecretExchangeHandler {
    fn label(&self) -> &str {
        SECRET_EXCHANGE_LABEL
    }

    fn on_open(&self, channel: Arc<dyn DataChannel>) {
        if let Ok(json) = self.hello.to_json() {
            let _ = channel.send_text(&json);
        }
    }

    fn on_message(&self, _channel: Arc<dyn DataChannel>, data: &[u8], _is_text: bool) {
        // The reply carries the peer's own credentials to persist.
        info!("pairing reply: {}", String::from_utf8_lossy(data));
        self.session.close();
    }
}
