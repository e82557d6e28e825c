//! Control-channel frames
//!
//! JSON messages carried on the `controlEvent` data channel (`auth`,
//! `authResult`, `redirect`) and on the one-shot pairing channel (`hello`).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::FsError;
use crate::protocol::FsCapability;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    /// Client credential: the local DTLS fingerprint and
    /// `HMAC-SHA256(password, fingerprint)` over it.
    #[serde(rename_all = "camelCase")]
    Auth {
        fingerprint: String,
        #[serde(with = "base64_vec")]
        hmac: Vec<u8>,
    },

    /// Server verdict plus the services this session exposes.
    #[serde(rename_all = "camelCase")]
    AuthResult {
        result: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        services: Option<HashMap<String, FsCapability>>,
    },

    /// Move the client to a fresh room.
    #[serde(rename_all = "camelCase")]
    Redirect { room_id: String },

    /// Pairing hello: the credentials the peer needs to reach this share.
    #[serde(rename_all = "camelCase")]
    Hello {
        room_id: String,
        signaling_key: String,
        token: String,
        name: String,
        user_agent: String,
        services: Vec<String>,
        version: u32,
    },

    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    pub fn to_json(&self) -> Result<String, FsError> {
        serde_json::to_string(self).map_err(|e| FsError::Other(e.to_string()))
    }

    pub fn from_json(data: &[u8]) -> Result<Self, FsError> {
        serde_json::from_slice(data).map_err(|_| FsError::Invalid)
    }
}

mod base64_vec {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::auth_hmac;

    #[test]
    fn auth_frame_shape() {
        let msg = ControlMessage::Auth {
            fingerprint: "AA:BB".into(),
            hmac: auth_hmac("s3cret", "AA:BB").to_vec(),
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"auth\""));
        assert!(json.contains("\"fingerprint\":\"AA:BB\""));

        match ControlMessage::from_json(json.as_bytes()).unwrap() {
            ControlMessage::Auth { fingerprint, hmac } => {
                assert_eq!(fingerprint, "AA:BB");
                assert_eq!(hmac, auth_hmac("s3cret", "AA:BB").to_vec());
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn auth_result_frame_shape() {
        let mut services = HashMap::new();
        services.insert("file".to_string(), FsCapability::read_only());
        let msg = ControlMessage::AuthResult { result: true, services: Some(services) };

        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"authResult\""));
        assert!(json.contains("\"result\":true"));
        assert!(json.contains("\"file\""));
    }

    #[test]
    fn redirect_frame_shape() {
        let msg = ControlMessage::Redirect { room_id: "room.AbCd123456".into() };
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"redirect\""));
        assert!(json.contains("\"roomId\":\"room.AbCd123456\""));
    }

    #[test]
    fn hello_frame_shape() {
        let msg = ControlMessage::Hello {
            room_id: "room-1".into(),
            signaling_key: "key".into(),
            token: "pw".into(),
            name: "desk".into(),
            user_agent: "peerfs".into(),
            services: vec!["file".into(), "no-client".into()],
            version: 1,
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"hello\""));
        assert!(json.contains("\"roomId\":\"room-1\""));
        assert!(json.contains("\"signalingKey\":\"key\""));
        assert!(json.contains("\"userAgent\":\"peerfs\""));
    }

    #[test]
    fn unknown_type_tolerated() {
        let msg = ControlMessage::from_json(br#"{"type":"future-frame","x":1}"#).unwrap();
        assert!(matches!(msg, ControlMessage::Unknown));
    }
}
