//! RPC client (`FsClient`)
//!
//! Allocates request ids, correlates replies through a pending table of
//! one-shot slots, and surfaces a filesystem-like API. Reads and writes
//! are chunked at the protocol's maximum payload; directory walks fetch
//! fixed-size windows until a short window ends the listing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::debug;

use peerfs_core::protocol::{FileEntry, FileOperationRequest, FileOperationResult};
use peerfs_core::{FsError, MAX_READ_SIZE, READ_DIR_WINDOW};

/// User-supplied request sink; hands a serialized request to the
/// transport.
pub type SendRequest = Arc<dyn Fn(&FileOperationRequest) -> Result<(), FsError> + Send + Sync>;

struct PendingTable {
    next_rid: u32,
    waiting: HashMap<u32, oneshot::Sender<FileOperationResult>>,
    closed: bool,
}

struct Inner {
    send: SendRequest,
    pending: Mutex<PendingTable>,
    max_read_size: usize,
    timeout: Duration,
}

/// A cheaply-clonable handle to one RPC session.
#[derive(Clone)]
pub struct FsClient {
    inner: Arc<Inner>,
}

impl FsClient {
    pub fn new(send: SendRequest) -> Self {
        Self::with_timeout(send, Duration::from_secs(peerfs_core::DEFAULT_REQUEST_TIMEOUT_SECS))
    }

    pub fn with_timeout(send: SendRequest, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                send,
                pending: Mutex::new(PendingTable {
                    next_rid: 0,
                    waiting: HashMap::new(),
                    closed: false,
                }),
                max_read_size: MAX_READ_SIZE,
                timeout,
            }),
        }
    }

    /// Issue one request and wait for its correlated reply.
    async fn request(&self, mut req: FileOperationRequest) -> Result<FileOperationResult, FsError> {
        let (tx, rx) = oneshot::channel();
        let rid = {
            let mut table = self.inner.pending.lock();
            if table.closed {
                return Err(FsError::Closed.with_context(&req.op, &req.path));
            }
            table.next_rid += 1;
            let rid = table.next_rid;
            table.waiting.insert(rid, tx);
            rid
        };
        req.rid = rid;

        if let Err(err) = (self.inner.send)(&req) {
            self.inner.pending.lock().waiting.remove(&rid);
            return Err(err.with_context(&req.op, &req.path));
        }

        let res = match timeout(self.inner.timeout, rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => return Err(FsError::Closed.with_context(&req.op, &req.path)),
            Err(_) => {
                // abandon the slot; a late reply is dropped by the demux
                self.inner.pending.lock().waiting.remove(&rid);
                return Err(FsError::Timeout.with_context(&req.op, &req.path));
            }
        };

        if let Some(msg) = res.error.as_deref() {
            if !msg.is_empty() {
                return Err(FsError::from_wire(msg).with_context(&req.op, &req.path));
            }
        }
        Ok(res)
    }

    /// Demultiplexer: parse either frame variant and deliver the result
    /// into the matching one-shot slot. Unknown rids are dropped.
    pub fn handle_message(&self, data: &[u8], is_text: bool) -> Result<(), FsError> {
        let res = FileOperationResult::from_frame(data, is_text)?;
        let slot = self.inner.pending.lock().waiting.remove(&res.rid);
        match slot {
            Some(tx) => {
                let _ = tx.send(res);
            }
            None => debug!("dropping reply for unknown rid {}", res.rid),
        }
        Ok(())
    }

    /// Fail every pending request with `Closed` and refuse new ones.
    pub fn abort(&self) {
        let mut table = self.inner.pending.lock();
        table.closed = true;
        table.waiting.clear();
    }

    pub async fn stat(&self, name: &str) -> Result<FileEntry, FsError> {
        let res = self.request(FileOperationRequest::new("stat", name)).await?;
        decode_entry(res.data)
    }

    /// Full listing, fetched in windows until a short window.
    pub async fn read_dir(&self, name: &str) -> Result<Vec<FileEntry>, FsError> {
        self.read_dir_range(name, 0, None).await
    }

    pub async fn read_dir_range(
        &self,
        name: &str,
        pos: usize,
        limit: Option<usize>,
    ) -> Result<Vec<FileEntry>, FsError> {
        let limit = limit.unwrap_or(usize::MAX);
        let mut entries: Vec<FileEntry> = Vec::new();
        loop {
            let n = (limit - entries.len()).min(READ_DIR_WINDOW);
            if n == 0 {
                return Ok(entries);
            }
            let mut req = FileOperationRequest::new("files", name);
            req.pos = (pos + entries.len()) as i64;
            req.len = n;
            let res = self.request(req).await?;
            let window: Vec<FileEntry> =
                serde_json::from_value(res.data.unwrap_or(serde_json::Value::Null))
                    .unwrap_or_default();
            let count = window.len();
            entries.extend(window);
            if count != n {
                return Ok(entries);
            }
        }
    }

    /// A positional handle; no round-trip happens until the first I/O.
    pub fn open(&self, name: &str) -> RemoteFile {
        RemoteFile { client: self.clone(), name: name.to_string(), pos: 0 }
    }

    /// Create (or truncate) a file and return a handle positioned at 0.
    pub async fn create(&self, name: &str) -> Result<RemoteFile, FsError> {
        self.truncate(name, 0).await?;
        Ok(self.open(name))
    }

    pub async fn open_writer(&self, name: &str, truncate: bool) -> Result<RemoteFile, FsError> {
        if truncate {
            self.truncate(name, 0).await?;
        }
        Ok(self.open(name))
    }

    pub async fn truncate(&self, name: &str, size: u64) -> Result<(), FsError> {
        let mut req = FileOperationRequest::new("truncate", name);
        req.pos = size as i64;
        self.request(req).await.map(|_| ())
    }

    pub async fn rename(&self, name: &str, new_name: &str) -> Result<(), FsError> {
        let mut req = FileOperationRequest::new("rename", name);
        req.path2 = new_name.to_string();
        self.request(req).await.map(|_| ())
    }

    pub async fn mkdir(&self, name: &str) -> Result<(), FsError> {
        self.request(FileOperationRequest::new("mkdir", name)).await.map(|_| ())
    }

    pub async fn remove(&self, name: &str) -> Result<(), FsError> {
        self.request(FileOperationRequest::new("remove", name)).await.map(|_| ())
    }

    /// Read a whole file into memory.
    pub async fn read_file(&self, name: &str) -> Result<Vec<u8>, FsError> {
        let mut file = self.open(name);
        let mut out = Vec::new();
        let mut chunk = vec![0u8; self.inner.max_read_size];
        loop {
            let n = file.read(&mut chunk).await?;
            out.extend_from_slice(&chunk[..n]);
            if n == 0 {
                return Ok(out);
            }
        }
    }

    /// Write a whole file, replacing its contents.
    pub async fn write_file(&self, name: &str, data: &[u8]) -> Result<(), FsError> {
        let file = self.create(name).await?;
        file.write_at(data, 0).await
    }
}

fn decode_entry(data: Option<serde_json::Value>) -> Result<FileEntry, FsError> {
    serde_json::from_value(data.unwrap_or(serde_json::Value::Null)).map_err(|_| FsError::Invalid)
}

/// A remote file with a cursor, exposed with directory-entry semantics
/// compatible with local file handles.
pub struct RemoteFile {
    client: FsClient,
    name: String,
    pos: u64,
}

impl RemoteFile {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn stat(&self) -> Result<FileEntry, FsError> {
        self.client.stat(&self.name).await
    }

    /// Read at the cursor. `Ok(0)` signals end-of-file.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        let len = buf.len().min(self.client.inner.max_read_size);
        if len == 0 {
            return Ok(0);
        }
        let mut req = FileOperationRequest::new("read", &self.name);
        req.pos = self.pos as i64;
        req.len = len;
        let chunk = match self.client.request(req).await {
            Ok(res) => res.buf.unwrap_or_default(),
            Err(err) if err.is_eof() => Vec::new(),
            Err(err) => return Err(err),
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        self.pos += n as u64;
        Ok(n)
    }

    /// Fill `buf` from `off`, issuing as many chunked reads as needed.
    /// Returns the bytes actually read; short means end-of-file.
    pub async fn read_at(&mut self, buf: &mut [u8], off: u64) -> Result<usize, FsError> {
        self.pos = off;
        let mut read = 0;
        while read < buf.len() {
            let n = self.read(&mut buf[read..]).await?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }

    /// Write at the cursor, advancing it.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, FsError> {
        let pos = self.pos;
        self.write_at(buf, pos).await?;
        self.pos = pos + buf.len() as u64;
        Ok(buf.len())
    }

    /// Write `buf` at `off` in protocol-sized chunks at advancing offsets.
    pub async fn write_at(&self, buf: &[u8], off: u64) -> Result<(), FsError> {
        let mut off = off;
        let mut rest = buf;
        while !rest.is_empty() {
            let n = rest.len().min(self.client.inner.max_read_size);
            let mut req = FileOperationRequest::new("write", &self.name);
            req.pos = off as i64;
            req.buf = Some(rest[..n].to_vec());
            self.client.request(req).await?;
            off += n as u64;
            rest = &rest[n..];
        }
        Ok(())
    }

    pub async fn truncate(&self, size: u64) -> Result<(), FsError> {
        self.client.truncate(&self.name, size).await
    }

    /// Next window of directory entries; fewer than `n` ends the walk.
    pub async fn read_dir(&mut self, n: usize) -> Result<Vec<FileEntry>, FsError> {
        let entries =
            self.client.read_dir_range(&self.name, self.pos as usize, Some(n)).await?;
        self.pos += entries.len() as u64;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerfs_core::protocol::encode_binary_frame;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// A sink that drops every request on the floor.
    fn black_hole() -> SendRequest {
        Arc::new(|_req: &FileOperationRequest| Ok(()))
    }

    #[tokio::test]
    async fn rids_are_monotonic_and_echoed() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let send: SendRequest = Arc::new(move |req: &FileOperationRequest| {
            sink.lock().push(req.rid);
            Ok(())
        });
        let client = FsClient::with_timeout(send, Duration::from_millis(50));

        let _ = client.stat("/a").await;
        let _ = client.stat("/b").await;
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn reply_resolves_pending_request() {
        let client = FsClient::new(black_hole());
        let demux = client.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let reply = FileOperationResult::data(
                1,
                serde_json::json!({"type": "directory", "name": ".", "size": 0}),
            );
            demux.handle_message(reply.to_json().unwrap().as_bytes(), true).unwrap();
        });

        let entry = client.stat("/").await.unwrap();
        assert!(entry.is_dir());
    }

    #[tokio::test]
    async fn binary_reply_resolves_read() {
        let client = FsClient::new(black_hole());
        let demux = client.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let frame = encode_binary_frame(1, b"hello");
            demux.handle_message(&frame, false).unwrap();
        });

        let mut file = client.open("/f.bin");
        let mut buf = [0u8; 16];
        assert_eq!(file.read(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
    }

    #[tokio::test]
    async fn timeout_fails_and_late_reply_is_dropped() {
        let client = FsClient::with_timeout(black_hole(), Duration::from_millis(30));
        let err = client.stat("/slow").await.err().unwrap();
        assert!(err.is_timeout());

        // the slot is gone; a late reply is silently discarded
        let reply = FileOperationResult::data(1, serde_json::json!({}));
        client.handle_message(reply.to_json().unwrap().as_bytes(), true).unwrap();
    }

    #[tokio::test]
    async fn unknown_rid_is_dropped() {
        let client = FsClient::new(black_hole());
        let reply = FileOperationResult::data(999, serde_json::json!({}));
        client.handle_message(reply.to_json().unwrap().as_bytes(), true).unwrap();
    }

    #[tokio::test]
    async fn abort_fails_pending_and_future_requests() {
        let client = FsClient::new(black_hole());

        let waiter = client.clone();
        let pending = tokio::spawn(async move { waiter.stat("/hang").await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        client.abort();
        let err = pending.await.unwrap().err().unwrap();
        assert!(err.is_closed());

        let err = client.stat("/after").await.err().unwrap();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn error_strings_map_back_to_kinds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let replies = Arc::new(Mutex::new(Vec::<FileOperationResult>::new()));
        let queue = replies.clone();
        let slot: Arc<Mutex<Option<FsClient>>> = Arc::new(Mutex::new(None));
        let demux = slot.clone();

        let send: SendRequest = Arc::new(move |req: &FileOperationRequest| {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut reply = queue.lock().remove(0);
            reply.rid = req.rid;
            let client = demux.lock().clone().unwrap();
            let json = reply.to_json().unwrap();
            tokio::spawn(async move {
                let _ = client.handle_message(json.as_bytes(), true);
            });
            Ok(())
        });
        let client = FsClient::new(send);
        *slot.lock() = Some(client.clone());

        replies.lock().push(FileOperationResult::error(0, "noent"));
        assert!(client.stat("/x").await.err().unwrap().is_not_found());

        replies.lock().push(FileOperationResult::error(0, "permission error"));
        assert!(client.remove("/x").await.err().unwrap().is_permission());

        replies.lock().push(FileOperationResult::error(0, "invalid argument"));
        assert!(client.mkdir("/../x").await.err().unwrap().is_invalid());

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
