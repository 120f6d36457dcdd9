//! Task registry and per-task progress fan-out.
//!
//! The registry owns every tracked task. Each task has:
//! - a lock-guarded record; readers always see a complete snapshot
//! - a bounded broadcast channel; slow subscribers lose the oldest events,
//!   never the newest, so the terminal event always arrives
//! - a cancellation token observed by the task's supervisor
//! - a "finished" latch the supervisor sets once the process is reaped
//!
//! Terminal tasks stay visible for the retention period, then disappear from
//! lookups and are physically removed (with their work directory) by the sweeper.

use dashmap::DashMap;
use futures_util::Stream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::config::TaskConfig;
use crate::core::error::{AppError, AppResult};
use crate::download::task::{ResultArtifact, TaskSnapshot, TaskStatus};

pub const CANCELLED_BY_CLIENT: &str = "cancelled by client";

struct TaskRecord {
    snapshot: TaskSnapshot,
    terminal_at: Option<Instant>,
    artifact: Option<ResultArtifact>,
    work_dir: Option<PathBuf>,
}

pub struct TaskHandle {
    id: String,
    state: Mutex<TaskRecord>,
    events: broadcast::Sender<TaskSnapshot>,
    cancel: CancellationToken,
    finished: watch::Sender<bool>,
}

impl TaskHandle {
    fn lock(&self) -> MutexGuard<'_, TaskRecord> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.lock().snapshot.clone()
    }

    pub fn work_dir(&self) -> Option<PathBuf> {
        self.lock().work_dir.clone()
    }

    /// Apply `f` to the record and publish the result if anything changed.
    ///
    /// No-op once the task is terminal. Publishing happens under the lock, so
    /// subscribers observe updates in exactly the order they were applied.
    fn transition<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut TaskRecord) -> bool,
    {
        let mut record = self.lock();
        if record.snapshot.is_terminal() {
            return false;
        }
        if !f(&mut record) {
            return false;
        }
        record.snapshot.updated_at = chrono::Utc::now();
        if record.snapshot.is_terminal() {
            record.terminal_at = Some(Instant::now());
        }
        // No receivers is fine; late subscribers start from the current snapshot.
        let _ = self.events.send(record.snapshot.clone());
        true
    }

    /// Mutate the snapshot; `f` returns whether it changed anything.
    pub fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut TaskSnapshot) -> bool,
    {
        self.transition(|record| f(&mut record.snapshot))
    }

    /// Terminal success. The artifact becomes readable in the same step.
    pub fn complete(&self, artifact: ResultArtifact) -> bool {
        self.transition(|record| {
            record.snapshot.mark_completed(artifact.size);
            record.artifact = Some(artifact);
            true
        })
    }

    /// Terminal failure with a client-visible cause.
    pub fn fail(&self, cause: &str) -> bool {
        self.transition(|record| {
            record.snapshot.mark_failed(cause);
            true
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Called by the supervisor once its process is gone.
    pub fn mark_finished(&self) {
        self.finished.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Wait until the supervisor reports it is done. Returns false on timeout.
    pub async fn wait_finished(&self, timeout: Duration) -> bool {
        let mut rx = self.finished.subscribe();
        let result = tokio::time::timeout(timeout, rx.wait_for(|done| *done)).await;
        matches!(result, Ok(Ok(_)))
    }

    fn subscribe(&self) -> TaskSubscription {
        let record = self.lock();
        TaskSubscription {
            initial: Some(record.snapshot.clone()),
            receiver: self.events.subscribe(),
            done: false,
        }
    }

    fn is_expired(&self, retention: Duration) -> bool {
        self.lock().terminal_at.is_some_and(|at| at.elapsed() >= retention)
    }
}

/// Live view of one task: the current snapshot, then every later change.
///
/// Ends after the terminal snapshot. Dropping it never affects the task.
pub struct TaskSubscription {
    initial: Option<TaskSnapshot>,
    receiver: broadcast::Receiver<TaskSnapshot>,
    done: bool,
}

impl TaskSubscription {
    pub async fn next(&mut self) -> Option<TaskSnapshot> {
        if self.done {
            return None;
        }
        if let Some(snapshot) = self.initial.take() {
            self.done = snapshot.is_terminal();
            return Some(snapshot);
        }
        loop {
            match self.receiver.recv().await {
                Ok(snapshot) => {
                    self.done = snapshot.is_terminal();
                    return Some(snapshot);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::debug!("Progress subscriber lagged, skipped {} updates", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = TaskSnapshot> + Send + 'static {
        futures_util::stream::unfold(self, |mut sub| async move {
            let next = sub.next().await?;
            Some((next, sub))
        })
    }
}

pub struct TaskRegistry {
    tasks: DashMap<String, Arc<TaskHandle>>,
    retention: Duration,
    event_buffer: usize,
    cancel_wait: Duration,
    shutdown: CancellationToken,
}

impl TaskRegistry {
    pub fn new(config: &TaskConfig) -> Self {
        Self {
            tasks: DashMap::new(),
            retention: config.retention,
            event_buffer: config.event_buffer.max(1),
            cancel_wait: config.cancel_wait,
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a new pending task under a fresh random id.
    ///
    /// With a `work_root` the task owns `<work_root>/<id>/`; the directory
    /// itself is created by whoever writes into it.
    pub fn create(&self, url: &str, format_id: &str, title: &str, work_root: Option<&Path>) -> Arc<TaskHandle> {
        let id = uuid::Uuid::new_v4().to_string();
        let work_dir = work_root.map(|root| root.join(&id));
        let (events, _) = broadcast::channel(self.event_buffer);
        let (finished, _) = watch::channel(false);

        let handle = Arc::new(TaskHandle {
            id: id.clone(),
            state: Mutex::new(TaskRecord {
                snapshot: TaskSnapshot::new(id.clone(), url.to_string(), format_id.to_string(), title.to_string()),
                terminal_at: None,
                artifact: None,
                work_dir,
            }),
            events,
            cancel: self.shutdown.child_token(),
            finished,
        });
        self.tasks.insert(id, Arc::clone(&handle));
        handle
    }

    /// Handle for a visible task. Expired tasks are reported as not found.
    pub fn handle(&self, id: &str) -> AppResult<Arc<TaskHandle>> {
        let handle = self
            .tasks
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| AppError::TaskNotFound(id.to_string()))?;
        if handle.is_expired(self.retention) {
            return Err(AppError::TaskNotFound(id.to_string()));
        }
        Ok(handle)
    }

    pub fn get(&self, id: &str) -> AppResult<TaskSnapshot> {
        Ok(self.handle(id)?.snapshot())
    }

    pub fn subscribe(&self, id: &str) -> AppResult<TaskSubscription> {
        Ok(self.handle(id)?.subscribe())
    }

    /// Completed output of a task, or `ResultNotReady` while it is still running.
    pub fn artifact(&self, id: &str) -> AppResult<ResultArtifact> {
        let handle = self.handle(id)?;
        let record = handle.lock();
        match (&record.snapshot.status, &record.artifact) {
            (TaskStatus::Completed, Some(artifact)) => Ok(artifact.clone()),
            (status, _) => Err(AppError::ResultNotReady(status.to_string())),
        }
    }

    /// Stop a task. Idempotent; terminal tasks are left untouched.
    ///
    /// Waits (bounded) for the supervisor to tear the process down, then makes
    /// sure the task is terminal even if the supervisor never reacted.
    pub async fn cancel(&self, id: &str) -> AppResult<TaskSnapshot> {
        let handle = self.handle(id)?;
        if handle.snapshot().is_terminal() {
            return Ok(handle.snapshot());
        }

        log::info!("Cancelling task {}", id);
        handle.cancel.cancel();
        if !handle.wait_finished(self.cancel_wait).await {
            log::warn!("Task {} supervisor did not finish within {:?}", id, self.cancel_wait);
        }
        handle.fail(CANCELLED_BY_CLIENT);
        Ok(handle.snapshot())
    }

    /// Evict a terminal task now. Returns false if the task is still running.
    pub async fn acknowledge(&self, id: &str) -> AppResult<bool> {
        let handle = self.handle(id)?;
        if !handle.snapshot().is_terminal() {
            return Ok(false);
        }
        if let Some((_, removed)) = self.tasks.remove(id) {
            remove_work_dir(&removed).await;
        }
        Ok(true)
    }

    /// Physically drop tasks whose retention has run out.
    pub async fn sweep(&self) -> usize {
        let expired: Vec<String> = self
            .tasks
            .iter()
            .filter(|entry| entry.value().is_expired(self.retention))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for id in expired {
            if let Some((_, handle)) = self.tasks.remove_if(&id, |_, h| h.is_expired(self.retention)) {
                remove_work_dir(&handle).await;
                removed += 1;
            }
        }
        if removed > 0 {
            log::debug!("Swept {} expired tasks, {} remain", removed, self.tasks.len());
        }
        removed
    }

    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.sweep().await;
                    }
                }
            }
        })
    }

    /// Cancel every live task and stop the sweeper.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.tasks.iter().filter(|entry| !entry.value().snapshot().is_terminal()).count()
    }
}

async fn remove_work_dir(handle: &TaskHandle) {
    let Some(dir) = handle.work_dir() else {
        return;
    };
    match fs_err::tokio::remove_dir_all(&dir).await {
        Ok(()) => log::debug!("Removed work dir of task {}", handle.id()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove work dir of task {}: {}", handle.id(), e),
    }
}
