//! Signaling relay protocol messages
//!
//! One JSON object per WebSocket text frame. Field names follow the relay
//! protocol exactly (`roomId`, `isExistClient`, `sdpMLineIndex`, ...).

use serde::{Deserialize, Serialize};

/// A TURN/STUN server handed out by the relay on accept.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<serde_json::Value>,
}

/// A trickled ICE candidate.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Everything that travels on the signaling stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    #[serde(rename = "register", rename_all = "camelCase")]
    Register {
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        authn_metadata: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signaling_key: Option<String>,
    },

    #[serde(rename = "accept", rename_all = "camelCase")]
    Accept {
        #[serde(default)]
        is_exist_client: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        authz_metadata: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ice_servers: Option<Vec<IceServer>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    #[serde(rename = "reject", rename_all = "camelCase")]
    Reject {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    #[serde(rename = "offer")]
    Offer { sdp: String },

    #[serde(rename = "answer")]
    Answer { sdp: String },

    #[serde(rename = "candidate")]
    Candidate { ice: IceCandidateInit },

    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "pong")]
    Pong,

    #[serde(rename = "bye")]
    Bye,

    #[serde(other)]
    Unknown,
}

impl SignalingMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// The relay's reply to `register`, kept for the session's lifetime.
#[derive(Clone, Debug, Default)]
pub struct AuthResult {
    /// True when a peer is already waiting in the room; that makes the
    /// local side the offerer.
    pub is_exist_client: bool,
    pub ice_servers: Vec<IceServer>,
}
