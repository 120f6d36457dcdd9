//! Getting downloaded bytes to the caller.
//!
//! Direct mode hands out a byte stream wired to the backend's stdout. Dropping
//! the stream before it ends is how a disconnected client kills the download.
//! Tracked mode opens the finished artifact and streams it from disk.

use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::io;
use std::process::ExitStatus;
use tokio::sync::oneshot;
use tokio_util::io::ReaderStream;
use tokio_util::sync::DropGuard;

use crate::core::error::AppResult;
use crate::download::supervisor::DirectProcess;
use crate::download::task::ResultArtifact;

/// Longest ASCII fallback name put in `Content-Disposition`.
const MAX_FALLBACK_NAME: usize = 200;

pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// A download streamed straight from the backend process.
pub struct DirectDownload {
    pub file_name: String,
    pub content_type: String,
    process_id: u32,
    pub stream: ByteStream,
}

impl DirectDownload {
    pub(crate) fn new(process: DirectProcess, file_name: String, content_type: String, chunk_size: usize) -> Self {
        let DirectProcess {
            pid,
            stdout,
            exit,
            guard,
        } = process;
        let state = DirectState::Streaming {
            reader: ReaderStream::with_capacity(stdout, chunk_size),
            exit,
            guard: guard.drop_guard(),
        };
        Self {
            file_name,
            content_type,
            process_id: pid,
            stream: stream::unfold(state, next_direct_chunk).boxed(),
        }
    }

    /// OS pid of the backend process feeding this stream.
    pub fn process_id(&self) -> u32 {
        self.process_id
    }
}

impl std::fmt::Debug for DirectDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectDownload")
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .field("process_id", &self.process_id)
            .finish_non_exhaustive()
    }
}

enum DirectState {
    Streaming {
        reader: ReaderStream<tokio::process::ChildStdout>,
        exit: oneshot::Receiver<Option<ExitStatus>>,
        /// Kills the process when the stream is dropped early
        guard: DropGuard,
    },
    Done,
}

async fn next_direct_chunk(state: DirectState) -> Option<(io::Result<Bytes>, DirectState)> {
    let DirectState::Streaming {
        mut reader,
        exit,
        guard,
    } = state
    else {
        return None;
    };

    match reader.next().await {
        Some(Ok(chunk)) => Some((Ok(chunk), DirectState::Streaming { reader, exit, guard })),
        Some(Err(e)) => Some((Err(e), DirectState::Done)),
        None => {
            // stdout closed: the process either finished or is about to.
            let status = exit.await.ok().flatten();
            // Nothing left to kill once the exit status is known.
            let _ = guard.disarm();
            match status {
                Some(status) if !status.success() => Some((
                    Err(io::Error::other(format!("download exited with {}", status))),
                    DirectState::Done,
                )),
                _ => None,
            }
        }
    }
}

/// A completed task's artifact opened for reading.
pub struct TrackedFile {
    pub file_name: String,
    pub content_type: String,
    pub size: u64,
    pub stream: ReaderStream<fs_err::tokio::File>,
}

impl TrackedFile {
    pub(crate) async fn open(artifact: &ResultArtifact, chunk_size: usize) -> AppResult<Self> {
        let file = fs_err::tokio::File::open(&artifact.path).await?;
        Ok(Self {
            file_name: artifact.file_name.clone(),
            content_type: artifact.content_type.clone(),
            size: artifact.size,
            stream: ReaderStream::with_capacity(file, chunk_size),
        })
    }
}

impl std::fmt::Debug for TrackedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedFile")
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

pub fn content_type_for_extension(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "flv" => "video/x-flv",
        "3gp" => "video/3gpp",
        "m4a" => "audio/mp4",
        "mp3" => "audio/mpeg",
        "opus" => "audio/opus",
        "ogg" | "oga" => "audio/ogg",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "aac" => "audio/aac",
        _ => "application/octet-stream",
    }
}

/// `<title>.<ext>`, with path separators and control characters removed.
///
/// # Examples
/// ```
/// use vidcore::download::delivery::download_file_name;
///
/// assert_eq!(download_file_name("AC/DC: Live", "mp4"), "AC_DC_ Live.mp4");
/// assert_eq!(download_file_name("   ", "webm"), "download.webm");
/// ```
pub fn download_file_name(title: &str, ext: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.');
    let stem = if cleaned.is_empty() { "download" } else { cleaned };
    format!("{}.{}", stem, ext)
}

/// `Content-Disposition: attachment` value with an ASCII fallback and an
/// RFC 5987 UTF-8 name.
///
/// # Examples
/// ```
/// use vidcore::download::delivery::content_disposition;
///
/// assert_eq!(
///     content_disposition("Café noir.mp4"),
///     "attachment; filename=\"Caf_noir.mp4\"; filename*=UTF-8''Caf%C3%A9%20noir.mp4"
/// );
/// ```
pub fn content_disposition(file_name: &str) -> String {
    let mut fallback: String = file_name
        .chars()
        .filter_map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                Some(c)
            } else if c.is_whitespace() {
                Some('_')
            } else {
                None
            }
        })
        .take(MAX_FALLBACK_NAME)
        .collect();
    if fallback.trim_matches(['.', '_']).is_empty() {
        fallback = "download".to_string();
    }
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(file_name)
    )
}
