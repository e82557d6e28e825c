//! peerfs core - shared types, wire protocol, and configuration
//!
//! This crate contains the foundational pieces used across all peerfs
//! components. It has no dependencies on networking or filesystem code.

pub mod config;
pub mod control;
pub mod crypto;
pub mod error;
pub mod path;
pub mod protocol;
pub mod sort;

pub use config::Config;
pub use error::FsError;
pub use protocol::*;

/// Largest payload carried by a single read/write request. Larger I/O is
/// chunked by the client; the server never fragments.
pub const MAX_READ_SIZE: usize = 65000;

/// Directory listings are fetched in windows of this many entries.
pub const READ_DIR_WINDOW: usize = 200;

/// Default cap on in-flight server-side file operations.
pub const DEFAULT_PARALLELISM: usize = 8;

/// Default deadline for a single client request, in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// How many room redirects a client follows before giving up.
pub const MAX_REDIRECT: usize = 3;

/// Appending this to a regular file path denotes its thumbnail.
pub const THUMBNAIL_SUFFIX: &str = "#thumbnail.jpeg";

/// Generated thumbnails are this many pixels wide.
pub const THUMBNAIL_WIDTH: u32 = 160;
