//! Thumbnail engine
//!
//! Content-addressed cached generation: the cache key is the SHA-1 of the
//! source path and the cache file is `<cache_dir>/<key>.jpeg`. Concurrent
//! requests for the same source are coalesced into a single generator run
//! whose result every waiter observes.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use peerfs_core::crypto::thumbnail_cache_key;
use peerfs_core::{Config, FsError, THUMBNAIL_WIDTH};

use crate::vfs::Vfs;

/// A generated thumbnail on the local disk.
#[derive(Clone, Debug)]
pub struct Thumbnail {
    pub mime: String,
    pub path: PathBuf,
}

#[async_trait]
pub trait Thumbnailer: Send + Sync {
    fn supported(&self, typ: &str) -> bool;

    async fn get_thumbnail(
        &self,
        fsys: &dyn Vfs,
        src: &str,
        typ: &str,
        cancel: &CancellationToken,
    ) -> Result<Thumbnail, FsError>;
}

/// Ordered list of generators; the first that claims a type wins, and a
/// "not supported" failure falls through to the next candidate.
#[derive(Default)]
pub struct ThumbnailerGroup {
    thumbnailers: Vec<Box<dyn Thumbnailer>>,
}

impl ThumbnailerGroup {
    pub fn register(&mut self, t: Box<dyn Thumbnailer>) {
        self.thumbnailers.push(t);
    }

    pub fn supported(&self, typ: &str) -> bool {
        self.thumbnailers.iter().any(|t| t.supported(typ))
    }

    pub async fn get_thumbnail(
        &self,
        fsys: &dyn Vfs,
        src: &str,
        typ: &str,
        cancel: &CancellationToken,
    ) -> Result<Thumbnail, FsError> {
        for t in &self.thumbnailers {
            if !t.supported(typ) {
                continue;
            }
            match t.get_thumbnail(fsys, src, typ, cancel).await {
                Err(FsError::NotSupported) => continue,
                other => return other,
            }
        }
        Err(FsError::NotSupported)
    }
}

static REGISTRY: OnceLock<ThumbnailerGroup> = OnceLock::new();

/// Initialize the process-wide registry from configuration. Must run
/// before any session starts; later calls are ignored.
pub fn init_thumbnailers(config: &Config) {
    let mut group = ThumbnailerGroup::default();
    if !config.thumbnail_cache_dir.is_empty() {
        group.register(Box::new(CachedThumbnailer::image(&config.thumbnail_cache_dir)));
        if !config.ffmpeg_path.is_empty() {
            group.register(Box::new(CachedThumbnailer::video(
                &config.thumbnail_cache_dir,
                &config.ffmpeg_path,
            )));
        }
    }
    let _ = REGISTRY.set(group);
}

/// The process-wide registry; empty until [`init_thumbnailers`] runs.
pub fn thumbnailers() -> &'static ThumbnailerGroup {
    REGISTRY.get_or_init(ThumbnailerGroup::default)
}

/// Produces the cache file for one source; the cached layer handles the
/// cache hit and the single-flight coalescing around it.
#[async_trait]
pub trait ThumbnailGenerator: Send + Sync {
    async fn generate(
        &self,
        fsys: &dyn Vfs,
        src: &str,
        dst: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), FsError>;
}

type PromiseValue = Option<Result<(), String>>;

enum Registration {
    Leader(watch::Sender<PromiseValue>),
    Waiter(watch::Receiver<PromiseValue>),
}

/// Content-addressed cache with single-flight generation.
pub struct CachedThumbnailer {
    cache_dir: PathBuf,
    supported: fn(&str) -> bool,
    generator: Box<dyn ThumbnailGenerator>,
    generating: Mutex<HashMap<String, watch::Receiver<PromiseValue>>>,
}

impl CachedThumbnailer {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        supported: fn(&str) -> bool,
        generator: Box<dyn ThumbnailGenerator>,
    ) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            supported,
            generator,
            generating: Mutex::new(HashMap::new()),
        }
    }

    pub fn image(cache_dir: impl Into<PathBuf>) -> Self {
        Self::new(cache_dir, is_supported_image, Box::new(ImageGenerator))
    }

    pub fn video(cache_dir: impl Into<PathBuf>, ffmpeg_path: impl Into<PathBuf>) -> Self {
        Self::new(
            cache_dir,
            is_supported_video,
            Box::new(VideoGenerator { ffmpeg: ffmpeg_path.into() }),
        )
    }

    fn register(&self, key: &str) -> Registration {
        let mut map = self.generating.lock();
        if let Some(rx) = map.get(key) {
            return Registration::Waiter(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        map.insert(key.to_string(), rx);
        Registration::Leader(tx)
    }

    fn finish(&self, key: &str, tx: &watch::Sender<PromiseValue>, result: &Result<(), FsError>) {
        let mut map = self.generating.lock();
        map.remove(key);
        let value = result.as_ref().map(|_| ()).map_err(|e| e.to_string());
        let _ = tx.send(Some(value));
    }
}

#[async_trait]
impl Thumbnailer for CachedThumbnailer {
    fn supported(&self, typ: &str) -> bool {
        (self.supported)(typ)
    }

    async fn get_thumbnail(
        &self,
        fsys: &dyn Vfs,
        src: &str,
        _typ: &str,
        cancel: &CancellationToken,
    ) -> Result<Thumbnail, FsError> {
        let key = thumbnail_cache_key(src);
        let cache_path = self.cache_dir.join(format!("{}.jpeg", key));
        let thumb = Thumbnail { mime: "image/jpeg".to_string(), path: cache_path.clone() };

        if cache_path.exists() {
            return Ok(thumb);
        }

        loop {
            match self.register(&key) {
                Registration::Waiter(mut rx) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(FsError::Closed),
                        changed = rx.wait_for(|v| v.is_some()) => {
                            if let Ok(value) = changed {
                                if matches!(value.as_ref(), Some(Ok(()))) {
                                    return Ok(thumb);
                                }
                            }
                            // the in-flight run failed; take over and retry
                        }
                    }
                }
                Registration::Leader(tx) => {
                    let _ = std::fs::create_dir_all(&self.cache_dir);
                    let result = tokio::select! {
                        _ = cancel.cancelled() => Err(FsError::Closed),
                        r = self.generator.generate(fsys, src, &cache_path, cancel) => r,
                    };
                    self.finish(&key, &tx, &result);
                    return result.map(|_| thumb);
                }
            }
        }
    }
}

fn is_supported_image(typ: &str) -> bool {
    matches!(typ, "image/jpeg" | "image/png" | "image/gif" | "image/bmp")
}

fn is_supported_video(typ: &str) -> bool {
    typ.starts_with("video/")
}

/// Decode via the source filesystem, resize to the fixed width, re-encode
/// as JPEG.
pub struct ImageGenerator;

#[async_trait]
impl ThumbnailGenerator for ImageGenerator {
    async fn generate(
        &self,
        fsys: &dyn Vfs,
        src: &str,
        dst: &Path,
        _cancel: &CancellationToken,
    ) -> Result<(), FsError> {
        let file = fsys.open(src).await?;
        let mut data = Vec::new();
        let mut chunk = vec![0u8; 256 * 1024];
        let mut off = 0u64;
        loop {
            let n = file.read_at(&mut chunk, off).await?;
            data.extend_from_slice(&chunk[..n]);
            off += n as u64;
            if n < chunk.len() {
                break;
            }
        }

        let dst = dst.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<(), FsError> {
            let img =
                image::load_from_memory(&data).map_err(|e| FsError::Other(e.to_string()))?;
            let (w, h) = (img.width().max(1), img.height().max(1));
            let height = ((h as u64 * THUMBNAIL_WIDTH as u64) / w as u64).max(1) as u32;
            let resized =
                img.resize_exact(THUMBNAIL_WIDTH, height, image::imageops::FilterType::Lanczos3);
            image::DynamicImage::ImageRgb8(resized.to_rgb8())
                .save_with_format(&dst, image::ImageFormat::Jpeg)
                .map_err(|e| FsError::Other(e.to_string()))
        })
        .await
        .map_err(|e| FsError::Other(e.to_string()))?
    }
}

/// Extract one frame with an external transcoder.
pub struct VideoGenerator {
    ffmpeg: PathBuf,
}

#[async_trait]
impl ThumbnailGenerator for VideoGenerator {
    async fn generate(
        &self,
        fsys: &dyn Vfs,
        src: &str,
        dst: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), FsError> {
        let input = match fsys.real_path(src) {
            Some(p) => p.to_string_lossy().into_owned(),
            None => src.to_string(),
        };
        let scale = format!("scale={}:-1", THUMBNAIL_WIDTH);
        let dst_str = dst.to_string_lossy().into_owned();

        let mut args: Vec<String> = vec![
            "-ss".into(),
            "3".into(),
            "-i".into(),
            input.clone(),
            "-vframes".into(),
            "1".into(),
            "-vcodec".into(),
            "mjpeg".into(),
            "-an".into(),
            "-vf".into(),
            scale.clone(),
            dst_str.clone(),
        ];

        if input.starts_with("https://") || input.starts_with("http://") {
            // Pre-resolve the host and pin it in a Host: header; the
            // transcoder's own resolver is unreliable in some setups.
            if let Some((resolved, host_header)) = resolve_http_host(&input).await {
                args[3] = resolved;
                args.splice(0..0, ["-headers".to_string(), host_header]);
            }
        }

        let status = run_transcoder(&self.ffmpeg, &args, cancel).await?;
        if !status.success() && !dst.exists() {
            warn!("transcoder failed for {}, retrying without seek", src);
            let retry_args: Vec<String> = vec![
                "-i".into(),
                input,
                "-vframes".into(),
                "1".into(),
                "-vcodec".into(),
                "mjpeg".into(),
                "-an".into(),
                "-vf".into(),
                scale,
                dst_str,
            ];
            let status = run_transcoder(&self.ffmpeg, &retry_args, cancel).await?;
            if !status.success() {
                return Err(FsError::Other("transcoder failed".to_string()));
            }
        }
        if !dst.exists() {
            return Err(FsError::Other("transcoder produced no output".to_string()));
        }
        Ok(())
    }
}

async fn resolve_http_host(input: &str) -> Option<(String, String)> {
    let mut parsed = Url::parse(input).ok()?;
    let host = parsed.host_str()?.to_string();
    let port = parsed.port_or_known_default().unwrap_or(443);
    debug!("resolving transcoder source host {}", host);
    let addr = tokio::net::lookup_host((host.as_str(), port)).await.ok()?.next()?;
    parsed.set_host(Some(&addr.ip().to_string())).ok()?;
    Some((parsed.to_string(), format!("Host: {}", host)))
}

async fn run_transcoder(
    ffmpeg: &Path,
    args: &[String],
    cancel: &CancellationToken,
) -> Result<std::process::ExitStatus, FsError> {
    let mut child = tokio::process::Command::new(ffmpeg)
        .args(args)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| FsError::Other(format!("failed to start transcoder: {}", e)))?;
    let status = tokio::select! {
        _ = cancel.cancelled() => None,
        status = child.wait() => Some(status),
    };
    match status {
        Some(status) => Ok(status?),
        None => {
            let _ = child.kill().await;
            Err(FsError::Closed)
        }
    }
}

/// Serve a byte window out of a generated thumbnail file.
pub fn read_thumbnail_bytes(thumb: &Thumbnail, pos: u64, len: usize) -> Result<Vec<u8>, FsError> {
    let mut file = std::fs::File::open(&thumb.path)?;
    if pos > 0 {
        file.seek(SeekFrom::Start(pos))?;
    }
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled == 0 && len > 0 {
        return Err(FsError::Eof);
    }
    buf.truncate(filled);
    Ok(buf)
}
