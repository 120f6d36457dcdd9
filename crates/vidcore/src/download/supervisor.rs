//! Process supervision for downloads.
//!
//! One worker per download owns the child process from spawn to reap. Nothing
//! else may signal or read from it; the outside world talks to the worker
//! through the task's cancellation token (tracked mode) or a drop guard (direct
//! mode).
//!
//! Tracked workers read both output pipes line by line, feed the progress
//! tracker, and enforce three limits:
//! - stall: no output line for `stall_timeout` (suspended while merging)
//! - overall: `download_timeout` from spawn
//! - cancel: the task's token
//!
//! Any of these ends in SIGTERM to the process group, `kill_grace`, SIGKILL.
//!
//! Every worker is tracked so [`Supervisor::shutdown`] can wait for process
//! groups to be reaped and work dirs removed before the host exits.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::core::config::{DeliveryConfig, TaskConfig};
use crate::core::error::{AppError, AppResult};
use crate::core::logging::sanitize_url_for_logging;
use crate::core::process::terminate_gracefully;
use crate::download::delivery::{content_type_for_extension, download_file_name};
use crate::download::formats::is_two_stream;
use crate::download::progress::{parse_line, ProgressTracker};
use crate::download::registry::{TaskHandle, CANCELLED_BY_CLIENT};
use crate::download::source::{DownloadRequest, ExtractionBackend};
use crate::download::ytdlp_errors::{analyze_ytdlp_error, last_error_line};

const STDERR_TAIL_LINES: usize = 200;
const LINE_CHANNEL_CAPACITY: usize = 256;

/// Client-visible failure causes. Details go to the log only.
pub mod cause {
    pub const SPAWN_FAILED: &str = "failed to start download";
    pub const STALLED: &str = "download stalled";
    pub const TIMED_OUT: &str = "download timed out";
    pub const EXIT_FAILURE: &str = "download failed";
    pub const NO_OUTPUT: &str = "download produced no output";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pipe {
    Stdout,
    Stderr,
}

/// Why the read loop stopped.
#[derive(Debug)]
enum Stop {
    Exited(ExitStatus),
    Cancelled,
    Stalled,
    TimedOut,
    WaitFailed(std::io::Error),
}

pub struct Supervisor {
    backend: Arc<dyn ExtractionBackend>,
    tasks: TaskConfig,
    delivery: DeliveryConfig,
    workers: TaskTracker,
    /// Parent of every direct-mode guard
    stopping: CancellationToken,
}

impl Supervisor {
    pub fn new(backend: Arc<dyn ExtractionBackend>, tasks: TaskConfig, delivery: DeliveryConfig) -> Self {
        Self {
            backend,
            tasks,
            delivery,
            workers: TaskTracker::new(),
            stopping: CancellationToken::new(),
        }
    }

    /// Workers still running, tracked and direct.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Kill every direct-mode process and refuse new work. Tracked tasks are
    /// stopped through their own cancellation tokens.
    pub fn stop(&self) {
        self.stopping.cancel();
        self.workers.close();
    }

    /// Stop, then wait up to `timeout` for every worker to finish tearing down
    /// its process. Returns false if some were still running.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.stop();
        if tokio::time::timeout(timeout, self.workers.wait()).await.is_ok() {
            return true;
        }
        log::warn!("{} download workers still running after {:?}", self.workers.len(), timeout);
        false
    }

    /// Start the worker for a tracked task. The task's work dir must be set.
    pub fn spawn_tracked(&self, handle: Arc<TaskHandle>, request: DownloadRequest) -> JoinHandle<()> {
        let backend = Arc::clone(&self.backend);
        let config = self.tasks.clone();
        self.workers.spawn(async move {
            run_tracked(backend.as_ref(), &config, &handle, request).await;
            handle.mark_finished();
        })
    }

    /// Start a download that writes the media to stdout.
    ///
    /// The returned [`DirectProcess`] hands out stdout; the child itself stays
    /// with a worker that kills it once the guard token is cancelled.
    pub async fn start_direct(&self, request: &DownloadRequest) -> AppResult<DirectProcess> {
        if self.stopping.is_cancelled() {
            return Err(AppError::Internal("download service is shutting down".to_string()));
        }
        let safe_url = sanitize_url_for_logging(request.url.as_str());
        let mut cmd = self.backend.download_command(request);
        prepare(&mut cmd);

        let mut child = spawn_child(cmd, self.tasks.spawn_timeout).await.map_err(|e| {
            log::error!("Failed to spawn direct download for {}: {}", safe_url, e);
            AppError::Internal(cause::SPAWN_FAILED.to_string())
        })?;

        let pid = child.id().unwrap_or_default();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Internal("child stdout was not captured".to_string()))?;
        let stderr_tail = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_tail_bytes(stderr, self.delivery.stderr_tail_bytes)));

        let guard = self.stopping.child_token();
        let (exit_tx, exit_rx) = oneshot::channel();
        let worker_guard = guard.clone();
        let grace = self.tasks.kill_grace;
        let timeout = self.tasks.download_timeout;

        self.workers.spawn(async move {
            let stop = tokio::select! {
                biased;
                _ = worker_guard.cancelled() => None,
                status = child.wait() => Some(status),
                _ = tokio::time::sleep(timeout) => {
                    log::warn!("Direct download for {} timed out after {:?}", safe_url, timeout);
                    None
                }
            };

            let status = match stop {
                Some(Ok(status)) => Some(status),
                Some(Err(e)) => {
                    log::error!("Waiting on direct download for {} failed: {}", safe_url, e);
                    None
                }
                None => {
                    log::info!("Direct download for {} stopped early, terminating pid {}", safe_url, pid);
                    match terminate_gracefully(&mut child, grace).await {
                        Ok(_) => None,
                        Err(e) => {
                            log::error!("Failed to terminate pid {}: {}", pid, e);
                            None
                        }
                    }
                }
            };

            if let Some(status) = status.filter(|s| !s.success()) {
                let tail = match stderr_tail {
                    Some(reader) => reader.await.unwrap_or_default(),
                    None => String::new(),
                };
                log::warn!(
                    "Direct download for {} exited with {:?} ({}): {}",
                    safe_url,
                    status.code(),
                    analyze_ytdlp_error(&tail),
                    last_error_line(&tail)
                );
            }
            let _ = exit_tx.send(status);
        });

        Ok(DirectProcess {
            pid,
            stdout,
            exit: exit_rx,
            guard,
        })
    }
}

/// A running direct-mode download.
pub struct DirectProcess {
    pub pid: u32,
    pub stdout: ChildStdout,
    /// Exit status once reaped; `None` if the process was terminated by us
    pub exit: oneshot::Receiver<Option<ExitStatus>>,
    /// Cancelling this kills the process
    pub guard: CancellationToken,
}

fn prepare(cmd: &mut Command) {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);
}

/// Spawn off the async runtime with a hard timeout.
///
/// A child that spawns after the timeout fired is dropped, which kills it.
async fn spawn_child(mut cmd: Command, timeout: Duration) -> std::io::Result<Child> {
    let spawn = tokio::task::spawn_blocking(move || cmd.spawn());
    match tokio::time::timeout(timeout, spawn).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(std::io::Error::other(join)),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("spawn did not complete within {:?}", timeout),
        )),
    }
}

async fn run_tracked(backend: &dyn ExtractionBackend, config: &TaskConfig, handle: &TaskHandle, request: DownloadRequest) {
    let task_id = handle.id().to_string();
    let safe_url = sanitize_url_for_logging(request.url.as_str());
    let cancel = handle.cancel_token();

    let Some(work_dir) = handle.work_dir() else {
        log::error!("Task {} has no work dir", task_id);
        handle.fail(cause::SPAWN_FAILED);
        return;
    };

    if cancel.is_cancelled() {
        handle.fail(CANCELLED_BY_CLIENT);
        return;
    }

    if let Err(e) = fs_err::tokio::create_dir_all(&work_dir).await {
        log::error!("Task {}: cannot create work dir: {}", task_id, e);
        handle.fail(cause::SPAWN_FAILED);
        return;
    }

    let mut cmd = backend.download_command(&request);
    prepare(&mut cmd);

    let mut child = match spawn_child(cmd, config.spawn_timeout).await {
        Ok(child) => child,
        Err(e) => {
            log::error!("Task {}: failed to spawn {}: {}", task_id, backend.name(), e);
            handle.fail(cause::SPAWN_FAILED);
            discard_work_dir(&task_id, &work_dir).await;
            return;
        }
    };
    log::info!(
        "📥 Task {} started: {} format {} (pid {:?})",
        task_id,
        safe_url,
        request.format_id,
        child.id()
    );

    let (line_tx, mut line_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(forward_lines(stdout, Pipe::Stdout, line_tx.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(forward_lines(stderr, Pipe::Stderr, line_tx.clone())));
    }
    drop(line_tx);

    let mut tracker = ProgressTracker::new(is_two_stream(&request.format_id), config.first_stream_weight);
    let mut stderr_tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let deadline = Instant::now() + config.download_timeout;
    let mut last_activity = Instant::now();
    let mut pipes_open = true;

    let stop = loop {
        let stall_at = last_activity + config.stall_timeout;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Stop::Cancelled,
            line = line_rx.recv(), if pipes_open => match line {
                Some((pipe, line)) => {
                    last_activity = Instant::now();
                    if pipe == Pipe::Stderr {
                        if stderr_tail.len() == STDERR_TAIL_LINES {
                            stderr_tail.pop_front();
                        }
                        stderr_tail.push_back(line.clone());
                    }
                    if let Some(event) = parse_line(&line) {
                        handle.update(|snapshot| tracker.apply(&event, snapshot));
                    }
                }
                None => pipes_open = false,
            },
            status = child.wait(), if !pipes_open => match status {
                Ok(status) => break Stop::Exited(status),
                Err(e) => break Stop::WaitFailed(e),
            },
            _ = tokio::time::sleep_until(stall_at), if !tracker.saw_merging() => break Stop::Stalled,
            _ = tokio::time::sleep_until(deadline) => break Stop::TimedOut,
        }
    };

    let status = match stop {
        Stop::Exited(status) => status,
        Stop::WaitFailed(e) => {
            log::error!("Task {}: waiting on process failed: {}", task_id, e);
            let _ = terminate_gracefully(&mut child, config.kill_grace).await;
            finish_failed(handle, &work_dir, &readers, cause::EXIT_FAILURE).await;
            return;
        }
        other => {
            let (reason, log_reason) = match other {
                Stop::Cancelled => (CANCELLED_BY_CLIENT, "cancelled"),
                Stop::Stalled => (cause::STALLED, "stalled"),
                _ => (cause::TIMED_OUT, "timed out"),
            };
            log::warn!("Task {} {}, terminating process group", task_id, log_reason);
            if let Err(e) = terminate_gracefully(&mut child, config.kill_grace).await {
                log::error!("Task {}: terminate failed: {}", task_id, e);
            }
            finish_failed(handle, &work_dir, &readers, reason).await;
            return;
        }
    };

    if !status.success() {
        let tail = stderr_tail.make_contiguous().join("\n");
        let detail = tracker.last_error().unwrap_or_else(|| last_error_line(&tail));
        log::warn!(
            "Task {} exited with {:?} ({}): {}",
            task_id,
            status.code(),
            analyze_ytdlp_error(&tail),
            detail
        );
        finish_failed(handle, &work_dir, &readers, cause::EXIT_FAILURE).await;
        return;
    }

    let output = match find_output(&work_dir, handle.id()).await {
        Some(output) => output,
        None => {
            log::warn!("Task {} exited cleanly but left no output in its work dir", task_id);
            finish_failed(handle, &work_dir, &readers, cause::NO_OUTPUT).await;
            return;
        }
    };

    // A two-stream download always passes through merging, even if the backend
    // never printed its merge marker.
    if is_two_stream(&request.format_id) && !tracker.saw_merging() {
        handle.update(|snapshot| tracker.enter_merging(snapshot));
    }

    let size = match fs_err::tokio::metadata(&output).await {
        Ok(meta) => meta.len(),
        Err(e) => {
            log::error!("Task {}: cannot stat output: {}", task_id, e);
            finish_failed(handle, &work_dir, &readers, cause::NO_OUTPUT).await;
            return;
        }
    };

    let ext = output.extension().and_then(|e| e.to_str()).unwrap_or("bin").to_string();
    let title = handle.snapshot().title;
    let completed = handle.complete(crate::download::task::ResultArtifact {
        path: output,
        file_name: download_file_name(&title, &ext),
        content_type: content_type_for_extension(&ext).to_string(),
        size,
    });

    if completed {
        log::info!("✅ Task {} completed: {} bytes", task_id, size);
    } else {
        // Lost a race with cancel; the artifact must not stay reachable.
        discard_work_dir(&task_id, &work_dir).await;
    }
    abort_readers(&readers);
}

async fn finish_failed(handle: &TaskHandle, work_dir: &Path, readers: &[JoinHandle<()>], reason: &str) {
    abort_readers(readers);
    handle.fail(reason);
    discard_work_dir(handle.id(), work_dir).await;
}

fn abort_readers(readers: &[JoinHandle<()>]) {
    for reader in readers {
        reader.abort();
    }
}

async fn discard_work_dir(task_id: &str, work_dir: &Path) {
    match fs_err::tokio::remove_dir_all(work_dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Task {}: failed to discard partial output: {}", task_id, e),
    }
}

/// Forward complete lines from a pipe. `\r` also ends a line.
async fn forward_lines<R>(pipe: R, kind: Pipe, tx: mpsc::Sender<(Pipe, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                for piece in text.split(['\r', '\n']).filter(|p| !p.trim().is_empty()) {
                    log::trace!("{:?}: {}", kind, piece);
                    if tx.send((kind, piece.to_string())).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                log::debug!("{:?} read error: {}", kind, e);
                break;
            }
        }
    }
}

/// Drain a pipe, keeping only its last `limit` bytes.
async fn read_tail_bytes<R>(mut pipe: R, limit: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let mut tail: VecDeque<u8> = VecDeque::with_capacity(limit.min(64 * 1024));
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend(&chunk[..n]);
                let overflow = tail.len().saturating_sub(limit);
                tail.drain(..overflow);
            }
        }
    }
    String::from_utf8_lossy(tail.make_contiguous()).into_owned()
}

/// The finished file for task `stem` inside `dir`.
///
/// Prefers `<stem>.<ext>` over per-stream intermediates like `<stem>.f137.mp4`,
/// and ignores partial files.
async fn find_output(dir: &Path, stem: &str) -> Option<PathBuf> {
    let mut entries = fs_err::tokio::read_dir(dir).await.ok()?;
    let mut best: Option<(bool, u64, PathBuf)> = None;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(rest) = name.strip_prefix(stem).and_then(|r| r.strip_prefix('.')) else {
            continue;
        };
        if rest.ends_with(".part") || rest.ends_with(".ytdl") || rest.contains(".temp") || rest == "part" {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let is_final = !rest.contains('.');
        let candidate = (is_final, meta.len(), path);
        if best.as_ref().is_none_or(|b| (candidate.0, candidate.1) > (b.0, b.1)) {
            best = Some(candidate);
        }
    }
    best.map(|(_, _, path)| path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_find_output_prefers_final_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("t1.f137.mp4"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("t1.mp4"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("t1.mp4.part"), vec![0u8; 500]).unwrap();
        std::fs::write(dir.path().join("other.mp4"), vec![0u8; 900]).unwrap();

        let found = find_output(dir.path(), "t1").await.unwrap();
        assert_eq!(found.file_name().unwrap(), "t1.mp4");
    }

    #[tokio::test]
    async fn test_find_output_none_when_only_partials() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("t1.webm.part"), b"x").unwrap();
        assert!(find_output(dir.path(), "t1").await.is_none());
        assert!(find_output(&dir.path().join("missing"), "t1").await.is_none());
    }

    #[tokio::test]
    async fn test_forward_lines_splits_carriage_returns() {
        let (tx, mut rx) = mpsc::channel(16);
        let input: &[u8] = b"[download]  10.0%\r[download]  20.0%\nERROR: x\n\n";
        forward_lines(input, Pipe::Stderr, tx).await;

        let mut lines = Vec::new();
        while let Some((pipe, line)) = rx.recv().await {
            assert_eq!(pipe, Pipe::Stderr);
            lines.push(line);
        }
        assert_eq!(lines, vec!["[download]  10.0%", "[download]  20.0%", "ERROR: x"]);
    }

    #[tokio::test]
    async fn test_read_tail_bytes_keeps_end() {
        let input: &[u8] = b"0123456789abcdef";
        assert_eq!(read_tail_bytes(input, 4).await, "cdef");
        assert_eq!(read_tail_bytes(&b"ab"[..], 4).await, "ab");
    }
}
