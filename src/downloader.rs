//! The download scheduler.
//!
//! Bounds simultaneous transfers, throttles aggregate throughput over 100ms
//! windows shared by every in-flight stream, retries failed transfers, and
//! drains the queue to completion or to a fatal credential error. All
//! scheduling decisions happen on one orchestration loop; transfers report
//! back over a channel.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::diff::DownloadTask;
use crate::errors::{SyncError, SyncResult};
use crate::events::{EventSink, SyncEvent};
use crate::remote::{ObjectStore, RemoteErrorCode};

/// Transfers above this size earn the pool one extra slot so a long download
/// does not block new work.
pub const LARGE_FILE_THRESHOLD: u64 = 20 * 1024 * 1024;

/// Throttle and status accounting interval.
const RATE_WINDOW: Duration = Duration::from_millis(100);
const SPEED_WINDOW: Duration = Duration::from_secs(1);
const SPEED_SAMPLES: usize = 3;
/// Sleeps shorter than this are not worth yielding for.
const MIN_THROTTLE_SLEEP: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Default)]
pub struct DownloadOutcome {
    pub files_downloaded: usize,
    pub bytes_downloaded: u64,
    pub elapsed: Duration,
}

enum TransferOutcome {
    Completed {
        task: DownloadTask,
    },
    TransportFailed {
        task: DownloadTask,
        error: String,
    },
    RemoteFailed {
        task: DownloadTask,
        code: RemoteErrorCode,
        status: u16,
        message: String,
    },
    LocalIoFailed {
        task: DownloadTask,
        error: String,
    },
}

struct Counters {
    total_bytes: u64,
    bytes_downloaded: u64,
    window_start: Instant,
    window_bytes: u64,
    second_start: Instant,
    second_bytes: u64,
    last_speeds: VecDeque<u64>,
    smoothed_bps: f64,
    last_status: Instant,
}

/// Aggregate progress shared by every in-flight transfer. One rate window
/// accounts bytes across all streams, which is what makes the throttle an
/// aggregate cap instead of a per-transfer one.
struct Progress {
    inner: Mutex<Counters>,
    max_bytes_per_window: Option<u64>,
    active: AtomicUsize,
    queued: AtomicUsize,
}

impl Progress {
    fn new(total_bytes: u64, max_bytes_per_sec: Option<u64>) -> Self {
        let now = Instant::now();
        Self {
            inner: Mutex::new(Counters {
                total_bytes,
                bytes_downloaded: 0,
                window_start: now,
                window_bytes: 0,
                second_start: now,
                second_bytes: 0,
                last_speeds: VecDeque::with_capacity(SPEED_SAMPLES),
                smoothed_bps: 0.0,
                last_status: now,
            }),
            max_bytes_per_window: max_bytes_per_sec.map(|cap| (cap / 10).max(1)),
            active: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
        }
    }

    fn set_counts(&self, active: usize, queued: usize) {
        self.active.store(active, Ordering::Relaxed);
        self.queued.store(queued, Ordering::Relaxed);
    }

    fn bytes_downloaded(&self) -> u64 {
        self.inner.lock().bytes_downloaded
    }

    /// Drops a permanently skipped task's size from the expected total so
    /// progress percentages stay accurate.
    fn reduce_total(&self, bytes: u64) {
        let mut inner = self.inner.lock();
        inner.total_bytes = inner.total_bytes.saturating_sub(bytes);
    }

    /// Accounts one received chunk. Returns how long the calling stream must
    /// sleep to keep the aggregate rate under the cap, and fires a status
    /// event when the 100ms tick elapsed.
    fn record_chunk(&self, len: u64, sink: &dyn EventSink) -> Option<Duration> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.bytes_downloaded += len;

        if now.duration_since(inner.second_start) >= SPEED_WINDOW {
            let sample = inner.second_bytes;
            if inner.last_speeds.len() == SPEED_SAMPLES {
                inner.last_speeds.pop_front();
            }
            inner.last_speeds.push_back(sample);
            inner.smoothed_bps = inner.last_speeds.iter().sum::<u64>() as f64
                / inner.last_speeds.len() as f64;
            inner.second_start = now;
            inner.second_bytes = 0;
        }
        inner.second_bytes += len;

        if now.duration_since(inner.last_status) >= RATE_WINDOW {
            inner.last_status = now;
            let active = self.active.load(Ordering::Relaxed);
            let queued = self.queued.load(Ordering::Relaxed);
            let percent = if inner.total_bytes > 0 {
                inner.bytes_downloaded as f64 / inner.total_bytes as f64 * 100.0
            } else {
                100.0
            };
            let seconds_remaining = (inner.smoothed_bps > 0.0).then(|| {
                let remaining = inner.total_bytes.saturating_sub(inner.bytes_downloaded);
                (remaining as f64 / inner.smoothed_bps) as u64
            });
            sink.emit(SyncEvent::SyncStatus {
                percent,
                active,
                incomplete: active + queued,
                bytes_downloaded: inner.bytes_downloaded,
                speed_bps: inner.smoothed_bps,
                seconds_remaining,
            });
        }

        if now.duration_since(inner.window_start) >= RATE_WINDOW {
            inner.window_start = now;
            inner.window_bytes = 0;
        }
        inner.window_bytes += len;

        let cap = self.max_bytes_per_window?;
        throttle_delay(
            now.duration_since(inner.window_start),
            inner.window_bytes,
            cap,
        )
    }
}

/// Sleep required once a window's byte budget is spent: the remainder of the
/// window plus a penalty proportional to the overshoot.
fn throttle_delay(window_elapsed: Duration, window_bytes: u64, cap: u64) -> Option<Duration> {
    if window_bytes < cap {
        return None;
    }
    let remaining = RATE_WINDOW.saturating_sub(window_elapsed);
    let overshoot = window_bytes - cap;
    let penalty_nanos = RATE_WINDOW.as_nanos() * overshoot as u128 / cap as u128;
    let sleep = remaining + Duration::from_nanos(penalty_nanos as u64);
    (sleep >= MIN_THROTTLE_SLEEP).then_some(sleep)
}

/// Largest first keeps the pool saturated with long-running transfers
/// instead of starving behind bursts of small completions.
fn order_largest_first(tasks: &mut [DownloadTask]) {
    tasks.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.path.cmp(&b.path)));
}

pub struct Downloader {
    store: Arc<ObjectStore>,
    sink: Arc<dyn EventSink>,
    root: PathBuf,
    concurrency: usize,
    max_bytes_per_sec: Option<u64>,
    exiting: Arc<AtomicBool>,
}

impl Downloader {
    pub fn new(
        store: Arc<ObjectStore>,
        sink: Arc<dyn EventSink>,
        root: &Path,
        concurrency: usize,
        max_bytes_per_sec: Option<u64>,
        exiting: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            sink,
            root: root.to_path_buf(),
            concurrency: concurrency.max(1),
            max_bytes_per_sec,
            exiting,
        }
    }

    /// The pool may exceed the configured limit by one slot while a large
    /// file is in flight; small-file transfers alone never exceed it.
    fn effective_limit(&self, active_large: usize) -> usize {
        self.concurrency + usize::from(active_large > 0)
    }

    /// Applies one finished transfer's outcome to the queue and counters.
    ///
    /// Completions count; transport failures and unknown remote codes
    /// requeue the task at the back (unless an interrupt is pending);
    /// terminal codes drop the task and correct the expected-byte total by
    /// its declared size; credential codes abort the whole run.
    fn handle_outcome(
        &self,
        outcome: TransferOutcome,
        queue: &mut VecDeque<DownloadTask>,
        progress: &Progress,
        files_downloaded: &mut usize,
    ) -> SyncResult<()> {
        match outcome {
            TransferOutcome::Completed { task } => {
                tracing::debug!("download complete: {}", task.path);
                *files_downloaded += 1;
            }
            TransferOutcome::TransportFailed { task, error } => {
                if !self.exiting.load(Ordering::SeqCst) {
                    tracing::warn!("download failed, requeued: {} ({error})", task.path);
                    queue.push_back(task);
                }
            }
            TransferOutcome::RemoteFailed {
                task,
                code,
                status,
                message,
            } => {
                tracing::warn!(
                    "download failed: {} (status: {status}, {code}: {message})",
                    task.path
                );
                if code.is_fatal() {
                    return Err(credential_error(&code));
                }
                if code.is_terminal() {
                    progress.reduce_total(task.size);
                } else if !self.exiting.load(Ordering::SeqCst) {
                    queue.push_back(task);
                }
            }
            TransferOutcome::LocalIoFailed { task, error } => {
                tracing::warn!("unable to write file: {} ({error})", task.path);
                progress.reduce_total(task.size);
            }
        }
        Ok(())
    }

    /// Drains `tasks` to completion. Individual failures are retried or
    /// dropped per the error taxonomy; only credential errors (or an
    /// interrupt) abort the whole run.
    pub async fn run(&self, mut tasks: Vec<DownloadTask>) -> SyncResult<DownloadOutcome> {
        if tasks.is_empty() {
            return Ok(DownloadOutcome::default());
        }
        order_largest_first(&mut tasks);
        let total_bytes: u64 = tasks.iter().map(|t| t.size).sum();
        let started = Instant::now();
        tracing::info!("downloading {} files...", tasks.len());
        self.sink.emit(SyncEvent::SyncStarted { total_bytes });

        let progress = Arc::new(Progress::new(total_bytes, self.max_bytes_per_sec));
        let (tx, mut rx) = mpsc::channel::<TransferOutcome>(64);
        let mut queue: VecDeque<DownloadTask> = tasks.into();
        let mut active = 0usize;
        let mut active_large = 0usize;
        let mut files_downloaded = 0usize;

        loop {
            if self.exiting.load(Ordering::SeqCst) {
                // In-flight transfers are abandoned, not drained.
                return Err(SyncError::Interrupted);
            }

            while active < self.effective_limit(active_large) {
                let Some(task) = queue.pop_front() else { break };
                tracing::debug!("starting download: {} ({} bytes)", task.path, task.size);
                active += 1;
                if task.size > LARGE_FILE_THRESHOLD {
                    active_large += 1;
                }
                tokio::spawn(transfer(
                    Arc::clone(&self.store),
                    self.root.clone(),
                    task,
                    Arc::clone(&progress),
                    Arc::clone(&self.sink),
                    tx.clone(),
                ));
            }
            progress.set_counts(active, queue.len());

            if active == 0 {
                break;
            }
            let Some(outcome) = rx.recv().await else { break };
            let finished = match &outcome {
                TransferOutcome::Completed { task }
                | TransferOutcome::TransportFailed { task, .. }
                | TransferOutcome::RemoteFailed { task, .. }
                | TransferOutcome::LocalIoFailed { task, .. } => task,
            };
            active -= 1;
            if finished.size > LARGE_FILE_THRESHOLD {
                active_large -= 1;
            }
            self.handle_outcome(outcome, &mut queue, &progress, &mut files_downloaded)?;
        }

        let outcome = DownloadOutcome {
            files_downloaded,
            bytes_downloaded: progress.bytes_downloaded(),
            elapsed: started.elapsed(),
        };
        self.sink.emit(SyncEvent::SyncComplete {
            files_downloaded,
            elapsed: outcome.elapsed,
        });
        Ok(outcome)
    }
}

fn credential_error(code: &RemoteErrorCode) -> SyncError {
    match code {
        RemoteErrorCode::InvalidAccessKeyId => SyncError::Credentials(
            "your access key is invalid, correct your configuration before trying again".into(),
        ),
        _ => SyncError::Credentials(
            "your secret key is invalid, correct your configuration before trying again".into(),
        ),
    }
}

/// One streamed transfer. Bytes are written incrementally to a freshly
/// created file; on failure the partial file is abandoned and the outcome
/// reported so the orchestrator can requeue or drop the task.
async fn transfer(
    store: Arc<ObjectStore>,
    root: PathBuf,
    task: DownloadTask,
    progress: Arc<Progress>,
    sink: Arc<dyn EventSink>,
    tx: mpsc::Sender<TransferOutcome>,
) {
    let destination = root.join(&task.path);
    if let Some(parent) = destination.parent() {
        if let Err(err) = tokio::fs::create_dir_all(parent).await {
            let _ = tx
                .send(TransferOutcome::LocalIoFailed {
                    task,
                    error: err.to_string(),
                })
                .await;
            return;
        }
    }
    let mut file = match tokio::fs::File::create(&destination).await {
        Ok(file) => file,
        Err(err) => {
            let _ = tx
                .send(TransferOutcome::LocalIoFailed {
                    task,
                    error: err.to_string(),
                })
                .await;
            return;
        }
    };

    let response = match store.get(&task.path).await {
        Ok(response) => response,
        Err(SyncError::Remote {
            code,
            status,
            message,
        }) => {
            let _ = tx
                .send(TransferOutcome::RemoteFailed {
                    task,
                    code,
                    status,
                    message,
                })
                .await;
            return;
        }
        Err(err) => {
            let _ = tx
                .send(TransferOutcome::TransportFailed {
                    task,
                    error: err.to_string(),
                })
                .await;
            return;
        }
    };

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = tx
                    .send(TransferOutcome::TransportFailed {
                        task,
                        error: err.to_string(),
                    })
                    .await;
                return;
            }
        };
        if let Err(err) = file.write_all(&bytes).await {
            let _ = tx
                .send(TransferOutcome::LocalIoFailed {
                    task,
                    error: err.to_string(),
                })
                .await;
            return;
        }
        if let Some(delay) = progress.record_chunk(bytes.len() as u64, sink.as_ref()) {
            tokio::time::sleep(delay).await;
        }
    }

    if let Err(err) = file.flush().await {
        let _ = tx
            .send(TransferOutcome::LocalIoFailed {
                task,
                error: err.to_string(),
            })
            .await;
        return;
    }
    let _ = tx.send(TransferOutcome::Completed { task }).await;
}
