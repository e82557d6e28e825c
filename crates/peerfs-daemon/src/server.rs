//! RPC server (`FsServer`)
//!
//! Frames filesystem operations as request/response over a data channel.
//! Requests are dispatched concurrently up to a configured parallelism;
//! there is no per-channel completion-order guarantee, correlation is
//! solely via the echoed request id. Response emission goes through the
//! caller-supplied writer, which the transport serializes.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use peerfs_core::path::fix_path;
use peerfs_core::protocol::{
    frame_rid, FileOperationRequest, FileOperationResult, FsCapability,
};
use peerfs_core::sort::{sort_entries, SortSpec};
use peerfs_core::{FsError, THUMBNAIL_SUFFIX};

use crate::mime::content_type_by_path;
use crate::thumbnail::{read_thumbnail_bytes, thumbnailers};
use crate::vfs::{OpenFlags, Vfs};

/// Serialized response sink; the transport's write path is assumed safe
/// against concurrent writers.
pub type ResultWriter = Arc<dyn Fn(&FileOperationResult) -> Result<(), FsError> + Send + Sync>;

/// One file-operation outcome before framing.
enum OpOutput {
    Json(serde_json::Value),
    Binary(Vec<u8>),
}

pub struct FsServer {
    fsys: Arc<dyn Vfs>,
    sem: Arc<Semaphore>,
}

impl FsServer {
    pub fn new(fsys: Arc<dyn Vfs>, parallels: usize) -> Self {
        Self { fsys, sem: Arc::new(Semaphore::new(parallels)) }
    }

    /// Capabilities advertised in the auth result's service map.
    pub fn capability(&self) -> FsCapability {
        self.fsys.capability()
    }

    /// Answer an incoming frame with a bare error, echoing whatever
    /// request id can be pulled out of it. Used for unauthenticated
    /// sessions and undecodable frames.
    pub fn error_reply(
        &self,
        data: &[u8],
        is_text: bool,
        writer: &ResultWriter,
        msg: &str,
    ) -> Result<(), FsError> {
        let rid = frame_rid(data, is_text).unwrap_or(0);
        writer(&FileOperationResult::error(rid, msg))
    }

    /// Decode one request frame, acquire a dispatch permit, and spawn the
    /// operation. The permit acquisition honors the session's cancellation.
    pub async fn handle_message(
        &self,
        cancel: &CancellationToken,
        data: &[u8],
        is_text: bool,
        writer: ResultWriter,
    ) -> Result<(), FsError> {
        if !is_text {
            // Bulk payloads travel server-to-client only; a binary frame
            // arriving here has no decodable operation.
            self.error_reply(data, is_text, &writer, "unsupported binary message")?;
            return Err(FsError::Invalid);
        }
        let op = FileOperationRequest::from_json(data)?;

        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(FsError::Closed),
            permit = self.sem.clone().acquire_owned() => {
                permit.map_err(|_| FsError::Closed)?
            }
        };

        let fsys = self.fsys.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let rid = op.rid;
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(FsError::Closed),
                result = handle_file_op(fsys.as_ref(), &op, &cancel) => result,
            };
            let result = match outcome {
                Ok(OpOutput::Json(value)) => FileOperationResult::data(rid, value),
                Ok(OpOutput::Binary(buf)) => FileOperationResult::binary(rid, buf),
                Err(err) => {
                    debug!("file op {} {} failed: {}", op.op, op.path, err);
                    FileOperationResult::error(rid, &err.to_wire())
                }
            };
            let had_error = result.error.is_some();
            if let Err(err) = writer(&result) {
                warn!("response write failed: {}", err);
                if !had_error {
                    let _ = writer(&FileOperationResult::error(rid, &err.to_wire()));
                }
            }
        });
        Ok(())
    }
}

async fn handle_file_op(
    fsys: &dyn Vfs,
    op: &FileOperationRequest,
    cancel: &CancellationToken,
) -> Result<OpOutput, FsError> {
    match op.op.as_str() {
        "stat" => {
            let entry = fsys.stat(fix_path(&op.path)).await?;
            Ok(OpOutput::Json(serde_json::to_value(entry).map_err(json_err)?))
        }
        "files" => {
            let mut entries = fsys.read_dir(fix_path(&op.path)).await?;
            let pos = op.pos.max(0) as usize;
            if pos >= entries.len() {
                return Ok(OpOutput::Json(serde_json::Value::Array(Vec::new())));
            }
            if let Some(spec) = op.sort_option().and_then(SortSpec::parse) {
                sort_entries(&mut entries, spec);
            }
            let end = if op.len > 0 {
                (pos + op.len).min(entries.len())
            } else {
                entries.len()
            };
            let window = &entries[pos..end];
            Ok(OpOutput::Json(serde_json::to_value(window).map_err(json_err)?))
        }
        "read" => {
            if let Some(src) = op.path.strip_suffix(THUMBNAIL_SUFFIX) {
                return read_thumbnail(fsys, fix_path(src), op.pos.max(0) as u64, op.len, cancel)
                    .await
                    .map(OpOutput::Binary);
            }
            let file = fsys.open(fix_path(&op.path)).await?;
            let mut buf = vec![0u8; op.len];
            let n = file.read_at(&mut buf, op.pos.max(0) as u64).await?;
            if n == 0 && op.len > 0 {
                return Err(FsError::Eof);
            }
            buf.truncate(n);
            Ok(OpOutput::Binary(buf))
        }
        "write" => {
            let writer = fsys.open_writer(fix_path(&op.path), OpenFlags::CREATE).await?;
            let buf = op.buf.as_deref().unwrap_or(&[]);
            writer.write_at(buf, op.pos.max(0) as u64).await?;
            Ok(OpOutput::Json(serde_json::Value::Null))
        }
        "truncate" => {
            fsys.truncate(fix_path(&op.path), op.pos.max(0) as u64).await?;
            Ok(OpOutput::Json(serde_json::Value::Null))
        }
        "mkdir" => {
            fsys.mkdir(fix_path(&op.path)).await?;
            Ok(OpOutput::Json(serde_json::Value::Null))
        }
        "rename" => {
            fsys.rename(fix_path(&op.path), fix_path(&op.path2)).await?;
            Ok(OpOutput::Json(serde_json::Value::Null))
        }
        "remove" => {
            fsys.remove(fix_path(&op.path)).await?;
            Ok(OpOutput::Json(serde_json::Value::Bool(true)))
        }
        _ => Err(FsError::Other("unsupported operation".to_string())),
    }
}

/// Resolve the thumbnail for `src` and serve bytes from the cache file at
/// the requested window.
async fn read_thumbnail(
    fsys: &dyn Vfs,
    src: &str,
    pos: u64,
    len: usize,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, FsError> {
    let typ = content_type_by_path(src);
    let thumb = thumbnailers().get_thumbnail(fsys, src, &typ, cancel).await?;
    read_thumbnail_bytes(&thumb, pos, len)
}

fn json_err(e: serde_json::Error) -> FsError {
    FsError::Other(e.to_string())
}
