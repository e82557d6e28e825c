//! Error kinds for peerfs
//!
//! Server operations stringify into a fixed wire vocabulary before
//! transmission; clients map those strings back into kinds and wrap them
//! with the failing operation and path.

use thiserror::Error;

/// All error kinds surfaced by peerfs components.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("noent")]
    NotFound,

    #[error("permission error")]
    Permission,

    #[error("invalid argument")]
    Invalid,

    #[error("closed")]
    Closed,

    #[error("timeout")]
    Timeout,

    /// Expected end-of-stream sentinel, not a failure.
    #[error("EOF")]
    Eof,

    #[error("unexpected EOF")]
    UnexpectedEof,

    #[error("auth error")]
    AuthFailed,

    #[error("too may redirect")]
    RedirectLoop,

    #[error("not supported format")]
    NotSupported,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{0}")]
    Other(String),

    /// An error wrapped with the operation and path it failed on.
    #[error("{op} {path}: {source}")]
    Op {
        op: String,
        path: String,
        #[source]
        source: Box<FsError>,
    },
}

impl FsError {
    /// Attach operation/path context the way callers see client failures.
    pub fn with_context(self, op: &str, path: &str) -> FsError {
        FsError::Op { op: op.to_string(), path: path.to_string(), source: Box::new(self) }
    }

    /// Unwrap context layers down to the underlying kind.
    pub fn root(&self) -> &FsError {
        match self {
            FsError::Op { source, .. } => source.root(),
            other => other,
        }
    }

    /// The fixed vocabulary sent over the wire.
    pub fn to_wire(&self) -> String {
        match self.root() {
            FsError::NotFound => "noent".to_string(),
            FsError::Permission => "permission error".to_string(),
            FsError::Invalid => "invalid argument".to_string(),
            FsError::Closed => "closed".to_string(),
            FsError::Eof => "EOF".to_string(),
            FsError::UnexpectedEof => "unexpected EOF".to_string(),
            other => other.to_string(),
        }
    }

    /// Map a wire string back to a kind. Unrecognized strings stay opaque.
    pub fn from_wire(msg: &str) -> FsError {
        match msg {
            "noent" => FsError::NotFound,
            "permission error" => FsError::Permission,
            "invalid argument" => FsError::Invalid,
            "closed" => FsError::Closed,
            "EOF" => FsError::Eof,
            "unexpected EOF" => FsError::UnexpectedEof,
            "timeout" => FsError::Timeout,
            "auth error" => FsError::AuthFailed,
            other => FsError::Other(other.to_string()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), FsError::NotFound)
    }

    pub fn is_permission(&self) -> bool {
        matches!(self.root(), FsError::Permission)
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self.root(), FsError::Invalid)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.root(), FsError::Closed)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), FsError::Timeout)
    }

    /// True for both the expected and the unexpected end-of-stream kinds.
    pub fn is_eof(&self) -> bool {
        matches!(self.root(), FsError::Eof | FsError::UnexpectedEof)
    }
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::NotFound => FsError::NotFound,
            ErrorKind::PermissionDenied => FsError::Permission,
            ErrorKind::InvalidInput => FsError::Invalid,
            ErrorKind::UnexpectedEof => FsError::UnexpectedEof,
            ErrorKind::TimedOut => FsError::Timeout,
            _ => FsError::Other(e.to_string()),
        }
    }
}
