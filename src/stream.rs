//! Media Stream Server
//!
//! Serves the designated media file of a download over HTTP with byte-range
//! seeking. Bytes come from the live swarm session when one exists in this
//! process (streaming while still downloading), otherwise from disk under
//! the record's save path. Matroska content without a complete on-disk copy
//! is remuxed on the fly to fragmented MP4, since browsers cannot seek it
//! natively.

use crate::engine::SwarmSession;
use crate::error::{Error, Result};
use crate::manager::DownloadManager;
use crate::types::{DownloadId, FileEntry};
use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, ReadBuf};
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::io::ReaderStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Extensions the stream server considers playable video
const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "webm", "avi", "mov", "m4v", "ts", "wmv", "flv", "mpg", "mpeg",
];

/// Matroska EBML magic at offset 0
const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

/// Join a relative path onto the download root, rejecting traversal.
///
/// Runs before any filesystem access: absolute paths, `..` segments, and
/// prefix components all fail with `PathTraversal`.
pub(crate) fn contained_path(root: &Path, relative: &Path) -> Result<PathBuf> {
    if relative.is_absolute() {
        return Err(Error::PathTraversal {
            path: relative.to_path_buf(),
        });
    }
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathTraversal {
                    path: relative.to_path_buf(),
                });
            }
        }
    }
    Ok(root.join(relative))
}

fn is_video(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn content_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("webm") => "video/webm",
        Some("avi") => "video/x-msvideo",
        Some("mov") => "video/quicktime",
        Some("ts") => "video/mp2t",
        Some("wmv") => "video/x-ms-wmv",
        Some("mpg") | Some("mpeg") => "video/mpeg",
        _ => "application/octet-stream",
    }
}

/// Check whether a file is a Matroska container, by extension first and
/// EBML magic as a fallback for misnamed files.
async fn is_matroska(path: &Path) -> bool {
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        let ext = ext.to_ascii_lowercase();
        if ext == "mkv" || ext == "webm" {
            return true;
        }
        if VIDEO_EXTENSIONS.contains(&ext.as_str()) && ext != "ts" {
            // A recognized non-Matroska extension; trust it
            return false;
        }
    }
    let mut magic = [0u8; 4];
    match tokio::fs::File::open(path).await {
        Ok(mut f) => f.read_exact(&mut magic).await.is_ok() && magic == EBML_MAGIC,
        Err(_) => false,
    }
}

/// A byte range already validated against the resource size
enum RangeOutcome {
    /// No (parseable) Range header; serve the whole resource with 200
    Full,
    /// Satisfiable range; serve 206 over `start..=end`
    Partial { start: u64, end: u64 },
    /// Unsatisfiable; answer 416 with `Content-Range: bytes */size`
    Unsatisfiable,
}

/// A numeric range bound as written by the client
enum RangeBound {
    Value(u64),
    /// All digits, but wider than u64; larger than any real file
    Huge,
    /// Not a number at all
    Invalid,
}

fn parse_bound(raw: &str) -> RangeBound {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return RangeBound::Invalid;
    }
    match raw.parse::<u64>() {
        Ok(v) => RangeBound::Value(v),
        Err(_) => RangeBound::Huge,
    }
}

/// Validate a Range header against the resource size.
///
/// `start >= size`, `end >= size`, `start > end`, and a negative start all
/// yield 416; a numeric bound too wide for u64 counts as past the end of
/// any file. Suffix ranges (`bytes=-N`) take the last N bytes. Anything
/// non-numeric is treated as no range at all.
fn evaluate_range(headers: &HeaderMap, size: u64) -> RangeOutcome {
    let Some(value) = headers.get(header::RANGE).and_then(|v| v.to_str().ok()) else {
        return RangeOutcome::Full;
    };
    let Some(spec) = value.trim().strip_prefix("bytes=") else {
        return RangeOutcome::Full;
    };

    // Only the first range of a multi-range request is honored
    let spec = spec.split(',').next().unwrap_or("").trim();

    let (start_str, end_str) = match spec.split_once('-') {
        Some((s, e)) => (s.trim(), e.trim()),
        None => return RangeOutcome::Full,
    };

    if start_str.is_empty() {
        // Suffix form: last N bytes. A second dash here means the client
        // wrote an explicitly negative start, which nothing satisfies.
        if end_str.contains('-') {
            return RangeOutcome::Unsatisfiable;
        }
        let len = match parse_bound(end_str) {
            RangeBound::Value(v) => v,
            RangeBound::Huge => size,
            RangeBound::Invalid => return RangeOutcome::Full,
        };
        if len == 0 || size == 0 {
            return RangeOutcome::Unsatisfiable;
        }
        let start = size.saturating_sub(len);
        return RangeOutcome::Partial {
            start,
            end: size - 1,
        };
    }

    let start = match parse_bound(start_str) {
        RangeBound::Value(v) => v,
        RangeBound::Huge => return RangeOutcome::Unsatisfiable,
        RangeBound::Invalid => return RangeOutcome::Full,
    };
    let end = if end_str.is_empty() {
        if size == 0 {
            return RangeOutcome::Unsatisfiable;
        }
        size - 1
    } else {
        match parse_bound(end_str) {
            RangeBound::Value(v) => v,
            RangeBound::Huge => return RangeOutcome::Unsatisfiable,
            RangeBound::Invalid => return RangeOutcome::Full,
        }
    };

    if start >= size || end >= size || start > end {
        return RangeOutcome::Unsatisfiable;
    }

    RangeOutcome::Partial { start, end }
}

/// The media file a stream request resolved to
struct StreamTarget {
    /// Absolute path on disk (engine writes here even for live sessions)
    path: PathBuf,
    size: u64,
    /// Live session and file index, when serving through the engine
    session: Option<(Arc<dyn SwarmSession>, usize)>,
    /// Whether every byte is already on disk
    complete: bool,
}

/// Serve the media file for a download, honoring `Range`.
///
/// Resolution order: live swarm session first (largest video file in the
/// session), then disk under the record's save path. `head_only` responses
/// carry the same headers with an empty body.
pub async fn serve(
    manager: &DownloadManager,
    id: DownloadId,
    headers: &HeaderMap,
    head_only: bool,
) -> Result<Response> {
    let view = manager.get(id).await?;
    let record = view.record;
    let root = &manager.config().download_root;

    let target = match manager.session(id) {
        Some(session) => resolve_live(&session, root, record.save_path.as_deref())?,
        None => {
            let rel = record
                .save_path
                .as_deref()
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            resolve_disk(root, rel).await?
        }
    };

    // Bodies end early when pause or delete cancels this token, not just
    // on client disconnect.
    let guard = manager.stream_guard(id);

    // Matroska without a complete on-disk copy has no random-access path
    // browsers can use; remux it. A complete file serves ranges as-is.
    if !target.complete && is_matroska(&target.path).await {
        return serve_remux(&target.path, head_only, guard);
    }

    match evaluate_range(headers, target.size) {
        RangeOutcome::Unsatisfiable => Ok(Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, format!("bytes */{}", target.size))
            .body(Body::empty())
            .map_err(|e| Error::Internal(e.to_string()))?),
        RangeOutcome::Partial { start, end } => {
            let builder = Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, content_type(&target.path))
                .header(header::ACCEPT_RANGES, "bytes")
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, end, target.size),
                )
                .header(header::CONTENT_LENGTH, end - start + 1);
            let body = if head_only {
                Body::empty()
            } else {
                Body::from_stream(ReaderStream::new(GuardedRead::new(
                    open_range(&target, start, end + 1).await?,
                    guard,
                )))
            };
            builder
                .body(body)
                .map_err(|e| Error::Internal(e.to_string()))
        }
        RangeOutcome::Full => {
            let builder = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type(&target.path))
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CONTENT_LENGTH, target.size);
            let body = if head_only || target.size == 0 {
                Body::empty()
            } else {
                Body::from_stream(ReaderStream::new(GuardedRead::new(
                    open_range(&target, 0, target.size).await?,
                    guard,
                )))
            };
            builder
                .body(body)
                .map_err(|e| Error::Internal(e.to_string()))
        }
    }
}

/// Enumerate the files of a download, from the live session when present,
/// otherwise from disk.
pub async fn list_files(manager: &DownloadManager, id: DownloadId) -> Result<Vec<FileEntry>> {
    let view = manager.get(id).await?;

    if let Some(session) = manager.session(id) {
        return Ok(session
            .files()
            .into_iter()
            .map(|f| FileEntry {
                path: f.path,
                length: f.length,
                bytes_done: f.bytes_done,
            })
            .collect());
    }

    let root = &manager.config().download_root;
    let rel = view
        .record
        .save_path
        .as_deref()
        .ok_or_else(|| Error::NotFound(id.to_string()))?;
    let base = contained_path(root, rel)?;

    let mut entries = Vec::new();
    collect_files(&base, &base, &mut entries).await?;
    Ok(entries)
}

fn resolve_live(
    session: &Arc<dyn SwarmSession>,
    root: &Path,
    save_path: Option<&Path>,
) -> Result<StreamTarget> {
    let files = session.files();
    let (index, entry) = files
        .iter()
        .enumerate()
        .filter(|(_, f)| is_video(&f.path))
        .max_by_key(|(_, f)| f.length)
        .ok_or_else(|| Error::NotFound("no video file in session".to_string()))?;

    let rel = match save_path {
        Some(base) => base.join(&entry.path),
        None => entry.path.clone(),
    };
    let path = contained_path(root, &rel)?;
    let complete = entry.bytes_done >= entry.length;

    let session = if session.supports_range() {
        Some((Arc::clone(session), index))
    } else {
        None
    };

    Ok(StreamTarget {
        path,
        size: entry.length,
        session,
        complete,
    })
}

async fn resolve_disk(root: &Path, relative: &Path) -> Result<StreamTarget> {
    let base = contained_path(root, relative)?;
    let meta = tokio::fs::metadata(&base)
        .await
        .map_err(|_| Error::NotFound(base.display().to_string()))?;

    let (path, size) = if meta.is_dir() {
        largest_video_in(&base)
            .await?
            .ok_or_else(|| Error::NotFound("no video file on disk".to_string()))?
    } else {
        if !is_video(&base) {
            return Err(Error::NotFound("no playable video file".to_string()));
        }
        (base, meta.len())
    };

    Ok(StreamTarget {
        path,
        size,
        session: None,
        complete: true,
    })
}

/// Recursively find the largest file with a video extension
async fn largest_video_in(dir: &Path) -> Result<Option<(PathBuf, u64)>> {
    let mut best: Option<(PathBuf, u64)> = None;
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                stack.push(path);
            } else if is_video(&path) {
                let size = meta.len();
                if best.as_ref().map(|(_, s)| size > *s).unwrap_or(true) {
                    best = Some((path, size));
                }
            }
        }
    }
    Ok(best)
}

async fn collect_files(base: &Path, dir: &Path, out: &mut Vec<FileEntry>) -> Result<()> {
    let meta = tokio::fs::metadata(dir)
        .await
        .map_err(|_| Error::NotFound(dir.display().to_string()))?;
    if meta.is_file() {
        out.push(FileEntry {
            path: dir
                .strip_prefix(base.parent().unwrap_or(base))
                .unwrap_or(dir)
                .to_path_buf(),
            length: meta.len(),
            bytes_done: meta.len(),
        });
        return Ok(());
    }

    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                stack.push(path);
            } else {
                out.push(FileEntry {
                    path: path.strip_prefix(base).unwrap_or(&path).to_path_buf(),
                    length: meta.len(),
                    bytes_done: meta.len(),
                });
            }
        }
    }
    Ok(())
}

/// Open a reader over `start..end` of the target, through the live session
/// when it supports ranged reads, otherwise from disk.
async fn open_range(
    target: &StreamTarget,
    start: u64,
    end: u64,
) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
    if let Some((session, index)) = &target.session {
        return session.read_file(*index, start..end).await;
    }

    let mut file = tokio::fs::File::open(&target.path)
        .await
        .map_err(|_| Error::NotFound(target.path.display().to_string()))?;
    file.seek(std::io::SeekFrom::Start(start)).await?;
    Ok(Box::new(file.take(end - start)))
}

/// Remux to fragmented MP4 and stream the muxer's stdout.
///
/// Copy-only (`-c copy`), so this is I/O bound, not a transcode. The child
/// is killed when the response body drops: a client disconnect drops it
/// directly, and a cancelled guard ends the body so the drop follows.
fn serve_remux(input: &Path, head_only: bool, guard: CancellationToken) -> Result<Response> {
    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp4");

    if head_only {
        return builder
            .body(Body::empty())
            .map_err(|e| Error::Internal(e.to_string()));
    }

    let mut child = Command::new("ffmpeg")
        .arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-i")
        .arg(input)
        .arg("-c")
        .arg("copy")
        .arg("-movflags")
        .arg("frag_keyframe+empty_moov+default_base_moof")
        .arg("-f")
        .arg("mp4")
        .arg("pipe:1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Internal(format!("failed to spawn remuxer: {}", e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Internal("remuxer has no stdout".to_string()))?;

    builder
        .body(Body::from_stream(ReaderStream::new(GuardedRead::new(
            Box::new(RemuxStream {
                _child: child,
                stdout,
            }),
            guard,
        ))))
        .map_err(|e| Error::Internal(e.to_string()))
}

/// Keeps the remuxer child alive for as long as its output is being read
struct RemuxStream {
    _child: Child,
    stdout: ChildStdout,
}

impl AsyncRead for RemuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

/// A reader that reports EOF once its guard token is cancelled, even while
/// the inner reader is blocked. The resulting stream end drops the body
/// and whatever resources it holds (file handle or remuxer child).
struct GuardedRead {
    inner: Box<dyn AsyncRead + Send + Unpin>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl GuardedRead {
    fn new(inner: Box<dyn AsyncRead + Send + Unpin>, guard: CancellationToken) -> Self {
        Self {
            inner,
            cancelled: Box::pin(guard.cancelled_owned()),
        }
    }
}

impl AsyncRead for GuardedRead {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range_headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, value.parse().unwrap());
        headers
    }

    #[test]
    fn containment_rejects_escapes_before_fs_access() {
        let root = Path::new("/data/downloads");
        assert!(contained_path(root, Path::new("show/ep1.mkv")).is_ok());
        assert!(contained_path(root, Path::new("../etc/passwd")).is_err());
        assert!(contained_path(root, Path::new("show/../../etc")).is_err());
        assert!(contained_path(root, Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn range_matrix_rejections() {
        let size = 1000;
        // start >= size
        assert!(matches!(
            evaluate_range(&range_headers("bytes=1000-"), size),
            RangeOutcome::Unsatisfiable
        ));
        // end >= size
        assert!(matches!(
            evaluate_range(&range_headers("bytes=0-1000"), size),
            RangeOutcome::Unsatisfiable
        ));
        // start > end
        assert!(matches!(
            evaluate_range(&range_headers("bytes=500-400"), size),
            RangeOutcome::Unsatisfiable
        ));
    }

    #[test]
    fn satisfiable_ranges() {
        let size = 1000;
        assert!(matches!(
            evaluate_range(&range_headers("bytes=0-499"), size),
            RangeOutcome::Partial { start: 0, end: 499 }
        ));
        assert!(matches!(
            evaluate_range(&range_headers("bytes=500-"), size),
            RangeOutcome::Partial {
                start: 500,
                end: 999
            }
        ));
        // Suffix: last 100 bytes
        assert!(matches!(
            evaluate_range(&range_headers("bytes=-100"), size),
            RangeOutcome::Partial {
                start: 900,
                end: 999
            }
        ));
    }

    #[test]
    fn oversized_and_negative_starts_are_unsatisfiable() {
        let size = 1000;
        // Numeric starts and ends too wide for u64 lie past any file end
        assert!(matches!(
            evaluate_range(&range_headers("bytes=99999999999999999999-"), size),
            RangeOutcome::Unsatisfiable
        ));
        assert!(matches!(
            evaluate_range(&range_headers("bytes=0-99999999999999999999"), size),
            RangeOutcome::Unsatisfiable
        ));
        // Explicitly negative start
        assert!(matches!(
            evaluate_range(&range_headers("bytes=-5-10"), size),
            RangeOutcome::Unsatisfiable
        ));
        // Oversized suffix length means the whole file
        assert!(matches!(
            evaluate_range(&range_headers("bytes=-99999999999999999999"), size),
            RangeOutcome::Partial { start: 0, end: 999 }
        ));
    }

    #[test]
    fn missing_or_garbled_range_serves_full() {
        assert!(matches!(
            evaluate_range(&HeaderMap::new(), 1000),
            RangeOutcome::Full
        ));
        assert!(matches!(
            evaluate_range(&range_headers("bytes=abc-def"), 1000),
            RangeOutcome::Full
        ));
        assert!(matches!(
            evaluate_range(&range_headers("items=0-5"), 1000),
            RangeOutcome::Full
        ));
    }

    #[test]
    fn video_extension_set() {
        assert!(is_video(Path::new("a/Movie.MKV")));
        assert!(is_video(Path::new("Movie.mp4")));
        assert!(!is_video(Path::new("Movie.srt")));
        assert!(!is_video(Path::new("Movie")));
    }

    #[test]
    fn content_types_cover_common_containers() {
        assert_eq!(content_type(Path::new("a.mp4")), "video/mp4");
        assert_eq!(content_type(Path::new("a.mkv")), "video/x-matroska");
        assert_eq!(content_type(Path::new("a.bin")), "application/octet-stream");
    }
}
