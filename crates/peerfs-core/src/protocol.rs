//! Filesystem RPC wire protocol
//!
//! Requests and results travel over a single data channel in two framings:
//! a JSON frame (UTF-8 text) for control and metadata, and a binary frame
//! for bulk payloads. The binary frame is a fixed 8-byte header - a
//! little-endian `u32` message type followed by a little-endian `u32`
//! request id - and then the raw payload. The transport's is-text flag is
//! the discriminator between the two.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::FsError;

/// Message type tag carried in the binary frame header.
pub const BINARY_MESSAGE_TYPE: u32 = 0;

/// Length of the binary frame header in bytes.
pub const BINARY_HEADER_LEN: usize = 8;

/// Entry type used for directories; everything else carries a MIME type.
pub const DIRECTORY_TYPE: &str = "directory";

/// What the backing store supports. Read-only views mask everything but
/// `read` to `false`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsCapability {
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub write: bool,
    #[serde(default)]
    pub create: bool,
    #[serde(default)]
    pub remove: bool,
}

impl FsCapability {
    /// Full access to a writable store.
    pub const fn writable() -> Self {
        Self { read: true, write: true, create: true, remove: true }
    }

    /// Read access only.
    pub const fn read_only() -> Self {
        Self { read: true, write: false, create: false, remove: false }
    }
}

/// Canonical metadata record exchanged on the wire. Immutable once emitted.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// MIME type, or `"directory"`. Empty when the type is unknown.
    #[serde(rename = "type", default)]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub size: u64,
    /// Modification time in milliseconds since the epoch.
    #[serde(rename = "updatedTime", default, skip_serializing_if = "is_zero_i64")]
    pub updated_time: i64,
    #[serde(rename = "createdTime", default, skip_serializing_if = "is_zero_i64")]
    pub created_time: i64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub writable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl FileEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == DIRECTORY_TYPE
    }

    /// Presence of `metadata.thumbnail` signals a thumbnail pseudo-path.
    pub fn has_thumbnail(&self) -> bool {
        self.metadata
            .as_ref()
            .map(|m| m.contains_key("thumbnail"))
            .unwrap_or(false)
    }

    pub fn set_metadata(&mut self, key: &str, value: serde_json::Value) {
        self.metadata
            .get_or_insert_with(serde_json::Map::new)
            .insert(key.to_string(), value);
    }

    /// File extension of the entry name, including the leading dot.
    pub fn extension(&self) -> &str {
        match self.name.rfind('.') {
            Some(i) if i > 0 => &self.name[i..],
            _ => "",
        }
    }
}

/// A single filesystem operation. `rid` is assigned by the client and
/// echoed verbatim by the server; 0 means unset and is omitted on the wire.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileOperationRequest {
    pub op: String,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub rid: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path2: String,
    #[serde(rename = "p", default, skip_serializing_if = "is_zero_i64")]
    pub pos: i64,
    #[serde(rename = "l", default, skip_serializing_if = "is_zero_usize")]
    pub len: usize,
    #[serde(rename = "b", default, with = "base64_bytes", skip_serializing_if = "Option::is_none")]
    pub buf: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<HashMap<String, String>>,
}

impl FileOperationRequest {
    pub fn new(op: &str, path: &str) -> Self {
        Self { op: op.to_string(), path: path.to_string(), ..Default::default() }
    }

    /// Serialize to the JSON frame.
    pub fn to_json(&self) -> Result<String, FsError> {
        serde_json::to_string(self).map_err(|e| FsError::Other(e.to_string()))
    }

    pub fn from_json(data: &[u8]) -> Result<Self, FsError> {
        serde_json::from_slice(data).map_err(|_| FsError::Invalid)
    }

    pub fn sort_option(&self) -> Option<&str> {
        self.options
            .as_ref()
            .and_then(|o| o.get("sort"))
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }
}

/// Terminal response to a request. Exactly one of `data`, `buf`, or
/// `error` is populated; a response with `buf` travels as a binary frame.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileOperationResult {
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub rid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "b", default, with = "base64_bytes", skip_serializing_if = "Option::is_none")]
    pub buf: Option<Vec<u8>>,
}

impl FileOperationResult {
    pub fn data(rid: u32, data: serde_json::Value) -> Self {
        Self { rid, data: Some(data), ..Default::default() }
    }

    pub fn binary(rid: u32, buf: Vec<u8>) -> Self {
        Self { rid, buf: Some(buf), ..Default::default() }
    }

    pub fn error(rid: u32, msg: &str) -> Self {
        Self { rid, error: Some(msg.to_string()), ..Default::default() }
    }

    /// Whether this result travels in the JSON frame variant.
    pub fn is_json(&self) -> bool {
        self.buf.is_none()
    }

    pub fn error_str(&self) -> &str {
        self.error.as_deref().unwrap_or("")
    }

    /// Encode as a JSON frame. Results carrying `buf` must use
    /// [`FileOperationResult::to_binary`] instead.
    pub fn to_json(&self) -> Result<String, FsError> {
        serde_json::to_string(self).map_err(|e| FsError::Other(e.to_string()))
    }

    /// Encode as a binary frame: header then the raw payload.
    pub fn to_binary(&self) -> Vec<u8> {
        encode_binary_frame(self.rid, self.buf.as_deref().unwrap_or(&[]))
    }

    /// Decode either frame variant, driven by the transport's is-text flag.
    pub fn from_frame(data: &[u8], is_text: bool) -> Result<Self, FsError> {
        if is_text {
            return serde_json::from_slice(data).map_err(|_| FsError::Invalid);
        }
        let (rid, payload) = decode_binary_frame(data)?;
        Ok(Self::binary(rid, payload.to_vec()))
    }
}

/// Build a binary frame from a request id and payload.
pub fn encode_binary_frame(rid: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(BINARY_HEADER_LEN + payload.len());
    out.extend_from_slice(&BINARY_MESSAGE_TYPE.to_le_bytes());
    out.extend_from_slice(&rid.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Split a binary frame into its request id and payload.
pub fn decode_binary_frame(data: &[u8]) -> Result<(u32, &[u8]), FsError> {
    if data.len() < BINARY_HEADER_LEN {
        return Err(FsError::Invalid);
    }
    let typ = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if typ != BINARY_MESSAGE_TYPE {
        return Err(FsError::Invalid);
    }
    let rid = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    Ok((rid, &data[BINARY_HEADER_LEN..]))
}

/// Pull the request id out of an incoming frame of either variant, for
/// error replies to messages that never get fully decoded.
pub fn frame_rid(data: &[u8], is_text: bool) -> Option<u32> {
    if is_text {
        FileOperationRequest::from_json(data).ok().map(|r| r.rid)
    } else {
        decode_binary_frame(data).ok().map(|(rid, _)| rid)
    }
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

fn is_zero_usize(v: &usize) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Byte buffers inside JSON frames are base64 strings.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_str(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let value = Option::<String>::deserialize(d)?;
        match value {
            Some(text) => STANDARD
                .decode(text.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
