//! Filesystem abstraction
//!
//! The RPC server is written against the capabilities it needs, not a
//! concrete store: a small trait with positional read/write handles, plus
//! a wrapper that masks the mutating operations for read-only views.

use std::path::PathBuf;

use async_trait::async_trait;

use peerfs_core::protocol::{FileEntry, FsCapability};
use peerfs_core::FsError;

/// How a writer opens its target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub create: bool,
    pub truncate: bool,
}

impl OpenFlags {
    /// Create-if-missing without clobbering existing bytes; the write
    /// path of the RPC server opens files this way.
    pub const CREATE: OpenFlags = OpenFlags { create: true, truncate: false };

    /// Create-or-truncate, the `create` operation.
    pub const CREATE_TRUNCATE: OpenFlags = OpenFlags { create: true, truncate: true };
}

/// A read handle with positional reads. Reads past end-of-file return a
/// short (possibly empty) count.
#[async_trait]
pub trait VfsFile: Send + Sync {
    async fn read_at(&self, buf: &mut [u8], off: u64) -> Result<usize, FsError>;
}

/// A write handle with positional writes.
#[async_trait]
pub trait VfsWriter: Send + Sync {
    async fn write_at(&self, buf: &[u8], off: u64) -> Result<usize, FsError>;
}

/// A backing store. All paths arriving here have already been through
/// wire normalization; implementations still validate before touching the
/// OS.
#[async_trait]
pub trait Vfs: Send + Sync {
    fn capability(&self) -> FsCapability;

    async fn stat(&self, name: &str) -> Result<FileEntry, FsError>;

    /// Ordered listing of a directory.
    async fn read_dir(&self, name: &str) -> Result<Vec<FileEntry>, FsError>;

    async fn open(&self, name: &str) -> Result<Box<dyn VfsFile>, FsError>;

    async fn open_writer(&self, name: &str, flags: OpenFlags) -> Result<Box<dyn VfsWriter>, FsError>;

    async fn create(&self, name: &str) -> Result<Box<dyn VfsWriter>, FsError>;

    async fn truncate(&self, name: &str, size: u64) -> Result<(), FsError>;

    async fn remove(&self, name: &str) -> Result<(), FsError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), FsError>;

    async fn mkdir(&self, name: &str) -> Result<(), FsError>;

    /// OS path of `name` when the store is directory-backed; external
    /// tools (the video transcoder) read the file directly.
    fn real_path(&self, _name: &str) -> Option<PathBuf> {
        None
    }
}

/// Masks every mutating operation of the wrapped store with a permission
/// error and reports read-only capabilities.
pub struct ReadOnlyVfs<V> {
    inner: V,
}

impl<V: Vfs> ReadOnlyVfs<V> {
    pub fn new(inner: V) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<V: Vfs> Vfs for ReadOnlyVfs<V> {
    fn capability(&self) -> FsCapability {
        FsCapability { read: self.inner.capability().read, ..FsCapability::default() }
    }

    async fn stat(&self, name: &str) -> Result<FileEntry, FsError> {
        let mut entry = self.inner.stat(name).await?;
        entry.writable = false;
        Ok(entry)
    }

    async fn read_dir(&self, name: &str) -> Result<Vec<FileEntry>, FsError> {
        let mut entries = self.inner.read_dir(name).await?;
        for entry in &mut entries {
            entry.writable = false;
        }
        Ok(entries)
    }

    async fn open(&self, name: &str) -> Result<Box<dyn VfsFile>, FsError> {
        self.inner.open(name).await
    }

    async fn open_writer(
        &self,
        _name: &str,
        _flags: OpenFlags,
    ) -> Result<Box<dyn VfsWriter>, FsError> {
        Err(FsError::Permission)
    }

    async fn create(&self, _name: &str) -> Result<Box<dyn VfsWriter>, FsError> {
        Err(FsError::Permission)
    }

    async fn truncate(&self, _name: &str, _size: u64) -> Result<(), FsError> {
        Err(FsError::Permission)
    }

    async fn remove(&self, _name: &str) -> Result<(), FsError> {
        Err(FsError::Permission)
    }

    async fn rename(&self, _from: &str, _to: &str) -> Result<(), FsError> {
        Err(FsError::Permission)
    }

    async fn mkdir(&self, _name: &str) -> Result<(), FsError> {
        Err(FsError::Permission)
    }

    fn real_path(&self, name: &str) -> Option<PathBuf> {
        self.inner.real_path(name)
    }
}
