//! Directory-backed filesystem
//!
//! Maps the store operations onto a rooted OS directory. Wire paths are
//! normalized and validated before they touch the filesystem; anything
//! escaping the root has already been rejected.

use std::fs::{File, Metadata, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use parking_lot::Mutex;

use peerfs_core::path::{fix_path, resolve};
use peerfs_core::protocol::{FileEntry, FsCapability, DIRECTORY_TYPE};
use peerfs_core::{FsError, THUMBNAIL_SUFFIX};

use crate::mime::content_type_by_path;
use crate::thumbnail::thumbnailers;
use crate::vfs::{OpenFlags, Vfs, VfsFile, VfsWriter};

/// A writable directory export.
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, FsError> {
        resolve(&self.root, name)
    }

    fn entry_for(&self, name: &str, meta: &Metadata) -> FileEntry {
        build_entry(name, meta, true)
    }
}

/// Build the wire metadata record for one OS entry. The writable bit is
/// the AND of the store capability and the owner-write permission bit.
fn build_entry(name: &str, meta: &Metadata, fs_writable: bool) -> FileEntry {
    let kind = if meta.is_dir() {
        DIRECTORY_TYPE.to_string()
    } else {
        content_type_by_path(name)
    };
    let mut entry = FileEntry {
        kind,
        name: name.to_string(),
        size: if meta.is_dir() { 0 } else { meta.len() },
        updated_time: time_millis(meta.modified().ok()),
        created_time: time_millis(meta.created().ok()),
        writable: fs_writable && owner_writable(meta),
        metadata: None,
    };
    if thumbnailers().supported(&entry.kind) {
        entry.set_metadata("thumbnail", serde_json::json!(THUMBNAIL_SUFFIX));
    }
    entry
}

fn time_millis(t: Option<std::time::SystemTime>) -> i64 {
    t.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn owner_writable(meta: &Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o200 != 0
}

#[cfg(not(unix))]
fn owner_writable(meta: &Metadata) -> bool {
    !meta.permissions().readonly()
}

/// Leaf name of a normalized wire path; the root is spelled `.`.
fn leaf_name(fixed: &str) -> &str {
    Path::new(fixed).file_name().and_then(|n| n.to_str()).unwrap_or(".")
}

#[async_trait]
impl Vfs for LocalFs {
    fn capability(&self) -> FsCapability {
        FsCapability::writable()
    }

    async fn stat(&self, name: &str) -> Result<FileEntry, FsError> {
        let path = self.resolve(name)?;
        let meta = std::fs::metadata(&path)?;
        Ok(self.entry_for(leaf_name(fix_path(name)), &meta))
    }

    async fn read_dir(&self, name: &str) -> Result<Vec<FileEntry>, FsError> {
        let path = self.resolve(name)?;
        let mut entries = Vec::new();
        for dirent in std::fs::read_dir(&path)? {
            let dirent = dirent?;
            let entry_name = match dirent.file_name().into_string() {
                Ok(n) => n,
                Err(_) => continue,
            };
            let meta = match dirent.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            entries.push(self.entry_for(&entry_name, &meta));
        }
        // OS iteration order is not stable across platforms
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn open(&self, name: &str) -> Result<Box<dyn VfsFile>, FsError> {
        let path = self.resolve(name)?;
        let file = File::open(&path)?;
        Ok(Box::new(LocalFile { file: Mutex::new(file) }))
    }

    async fn open_writer(
        &self,
        name: &str,
        flags: OpenFlags,
    ) -> Result<Box<dyn VfsWriter>, FsError> {
        let path = self.resolve(name)?;
        let file = OpenOptions::new()
            .write(true)
            .create(flags.create)
            .truncate(flags.truncate)
            .open(&path)?;
        Ok(Box::new(LocalFile { file: Mutex::new(file) }))
    }

    async fn create(&self, name: &str) -> Result<Box<dyn VfsWriter>, FsError> {
        self.open_writer(name, OpenFlags::CREATE_TRUNCATE).await
    }

    async fn truncate(&self, name: &str, size: u64) -> Result<(), FsError> {
        let path = self.resolve(name)?;
        // create-if-missing: client-side create is truncate-to-zero
        let file = OpenOptions::new().write(true).create(true).open(&path)?;
        file.set_len(size)?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), FsError> {
        let path = self.resolve(name)?;
        if std::fs::metadata(&path)?.is_dir() {
            std::fs::remove_dir(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        std::fs::rename(&src, &dst)?;
        Ok(())
    }

    async fn mkdir(&self, name: &str) -> Result<(), FsError> {
        let path = self.resolve(name)?;
        std::fs::create_dir(&path)?;
        Ok(())
    }

    fn real_path(&self, name: &str) -> Option<PathBuf> {
        self.resolve(name).ok()
    }
}

/// Positional I/O over one open file. A mutex serializes the seek+access
/// pair; handles are per-request, so there is no contention to speak of.
struct LocalFile {
    file: Mutex<File>,
}

#[async_trait]
impl VfsFile for LocalFile {
    async fn read_at(&self, buf: &mut [u8], off: u64) -> Result<usize, FsError> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(off))?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

#[async_trait]
impl VfsWriter for LocalFile {
    async fn write_at(&self, buf: &[u8], off: u64) -> Result<usize, FsError> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(off))?;
        file.write_all(buf)?;
        Ok(buf.len())
    }
}
