//! The update loop: repeated (manifest refresh → diff → delete → download)
//! cycles with a per-second countdown between them.
//!
//! One loop owns the cache and all network clients; everything observable
//! leaves through the event sink. A pause flag freezes the countdown in
//! place, an exiting flag stops the loop at the next suspension point, and
//! a running application under the target directory blocks the cycle until
//! it exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::cache::SyncCache;
use crate::config::SyncConfig;
use crate::deleter;
use crate::diff::{self, DownloadTask};
use crate::downloader::Downloader;
use crate::errors::{SyncError, SyncResult};
use crate::events::{DeleteConfirmer, EventSink, SyncEvent};
use crate::manifest::ManifestClient;
use crate::process;
use crate::remote::ObjectStore;

const PROCESS_POLL_INTERVAL: Duration = Duration::from_secs(5);
const UPDATE_CHECK_INTERVAL: Duration = Duration::from_secs(30 * 60);

pub struct UpdateLoop {
    config: SyncConfig,
    cache: SyncCache,
    manifest_client: ManifestClient,
    store: Arc<ObjectStore>,
    sink: Arc<dyn EventSink>,
    confirmer: Arc<dyn DeleteConfirmer>,
    exiting: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    last_update_check: Instant,
}

impl UpdateLoop {
    pub fn new(
        config: SyncConfig,
        sink: Arc<dyn EventSink>,
        confirmer: Arc<dyn DeleteConfirmer>,
    ) -> SyncResult<Self> {
        let cache = SyncCache::load(&config.cache_path, &config.local_directory);
        let manifest_client = ManifestClient::new(config.manifest_url.clone())?;
        let store = Arc::new(ObjectStore::new(&config)?);
        Ok(Self {
            config,
            cache,
            manifest_client,
            store,
            sink,
            confirmer,
            exiting: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            last_update_check: Instant::now(),
        })
    }

    /// Flag a signal handler sets to stop the loop. In-flight transfers are
    /// abandoned, not drained.
    pub fn exiting_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.exiting)
    }

    /// Flag a frontend toggles to freeze the between-cycle countdown.
    pub fn paused_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.paused)
    }

    /// Runs cycles until interrupted, or exactly one in one-shot mode. The
    /// first cycle always diffs even when the manifest is unchanged, so a
    /// locally modified tree is repaired on startup.
    pub async fn run(&mut self) -> SyncResult<()> {
        let mut force = true;
        loop {
            self.interruption_check()?;
            self.wait_for_blocking_processes().await?;

            self.sink.emit(SyncEvent::CheckingForUpdates);
            let changed = self
                .manifest_client
                .refresh_if_stale(&mut self.cache, self.sink.as_ref())
                .await?;

            if changed || force {
                self.sync_cycle().await?;
            } else {
                self.sink.emit(SyncEvent::UpToDate);
            }
            force = false;

            if self.config.once {
                return Ok(());
            }
            self.countdown().await?;
        }
    }

    fn interruption_check(&self) -> SyncResult<()> {
        if self.exiting.load(Ordering::SeqCst) {
            Err(SyncError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Blocks until no application is running from under the target
    /// directory. The waiting notification fires once per distinct process
    /// list, not once per poll.
    async fn wait_for_blocking_processes(&self) -> SyncResult<()> {
        if self.config.ignore_running {
            return Ok(());
        }
        let mut last_names: Vec<String> = Vec::new();
        loop {
            self.interruption_check()?;
            let dir = self.config.local_directory.clone();
            let names = match tokio::task::spawn_blocking(move || {
                process::running_process_names(&dir)
            })
            .await
            {
                Ok(names) => names,
                Err(err) => {
                    tracing::warn!("process check failed, assuming nothing is running: {err}");
                    Vec::new()
                }
            };
            if names.is_empty() {
                return Ok(());
            }
            if names != last_names {
                self.sink.emit(SyncEvent::WaitingForProcesses {
                    names: names.clone(),
                });
                last_names = names;
            }
            tokio::time::sleep(PROCESS_POLL_INTERVAL).await;
        }
    }

    /// One full cycle: diff, delete, download, then one re-check of the
    /// diff+download step when anything was downloaded. The cache is
    /// persisted once the whole batch has settled.
    async fn sync_cycle(&mut self) -> SyncResult<()> {
        let mut pass = 0;
        loop {
            let tasks = self.compute_downloads().await?;
            if pass == 0 {
                self.apply_deletions().await?;
            }
            if tasks.is_empty() {
                if pass == 0 {
                    self.sink.emit(SyncEvent::UpToDate);
                }
                break;
            }

            let downloader = Downloader::new(
                Arc::clone(&self.store),
                Arc::clone(&self.sink),
                &self.config.local_directory,
                self.config.max_concurrency,
                self.config.max_bytes_per_sec,
                Arc::clone(&self.exiting),
            );
            let outcome = downloader.run(tasks).await?;

            pass += 1;
            if pass >= 2 || outcome.files_downloaded == 0 {
                break;
            }
        }
        self.cache.mark_local_scan_complete(&self.config.local_directory);
        self.cache.save()?;
        Ok(())
    }

    /// Hashes the local tree against the manifest on a blocking worker so
    /// timers and network callbacks keep being serviced.
    async fn compute_downloads(&mut self) -> SyncResult<Vec<DownloadTask>> {
        self.sink.emit(SyncEvent::CheckingFiles);
        let manifest = self.cache.manifest().clone();
        let root = self.config.local_directory.clone();
        let exclude = self.config.exclude_dir.clone();
        let verify = self.config.verify;
        let sink = Arc::clone(&self.sink);
        let mut index = self.cache.take_local_files();

        let joined = tokio::task::spawn_blocking(move || {
            let tasks = diff::compute_downloads(
                &manifest,
                &root,
                &mut index,
                exclude.as_deref(),
                verify,
                |checked, total| sink.emit(SyncEvent::HashingProgress { checked, total }),
            );
            (tasks, index)
        })
        .await
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;

        let (tasks, index) = joined;
        self.cache.restore_local_files(index);
        tasks
    }

    /// Finds and removes redundant local files. Runs on a blocking worker
    /// because the confirmation prompt may wait on stdin.
    async fn apply_deletions(&mut self) -> SyncResult<()> {
        if self.config.no_delete {
            return Ok(());
        }
        let candidates = diff::find_redundant_files(
            self.cache.manifest(),
            &self.config.local_directory,
            self.config.exclude_dir.as_deref(),
            self.cache.previous_manifest(),
            self.config.delete_all,
        );
        if candidates.is_empty() {
            return Ok(());
        }

        let root = self.config.local_directory.clone();
        let threshold = self.config.max_files_removed_without_warning;
        let without_asking = self.config.delete_without_asking;
        let sink = Arc::clone(&self.sink);
        let confirmer = Arc::clone(&self.confirmer);
        let mut index = self.cache.take_local_files();

        let (deleted, index) = tokio::task::spawn_blocking(move || {
            let deleted = deleter::delete_local_files(
                &candidates,
                &root,
                &mut index,
                threshold,
                without_asking,
                sink.as_ref(),
                confirmer.as_ref(),
            );
            (deleted, index)
        })
        .await
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;

        self.cache.restore_local_files(index);
        if deleted > 0 {
            tracing::info!("removed {deleted} redundant files");
        }
        Ok(())
    }

    /// Per-second countdown to the next cycle. Pausing freezes the remaining
    /// time; the countdown is skipped entirely when the periodic client
    /// update check is overdue.
    async fn countdown(&mut self) -> SyncResult<()> {
        if self.last_update_check.elapsed() >= UPDATE_CHECK_INTERVAL {
            self.sink.emit(SyncEvent::UpdateCheckDue);
            self.last_update_check = Instant::now();
            return Ok(());
        }

        let mut remaining = self.config.check_interval.as_secs();
        while remaining > 0 {
            self.interruption_check()?;
            if self.paused.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            self.sink.emit(SyncEvent::TimeRemaining { seconds: remaining });
            tokio::time::sleep(Duration::from_secs(1)).await;
            remaining -= 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingSink(Mutex<Vec<SyncEvent>>);
    impl EventSink for RecordingSink {
        fn emit(&self, event: SyncEvent) {
            self.0.lock().push(event);
        }
    }

    struct NoConfirm;
    impl DeleteConfirmer for NoConfirm {
        fn confirm(&self, _count: usize) -> bool {
            false
        }
    }

    fn test_loop(tmp: &tempfile::TempDir, sink: Arc<RecordingSink>) -> UpdateLoop {
        let config = SyncConfig {
            local_directory: tmp.path().to_path_buf(),
            manifest_url: "http://example.test/hashes.txt".into(),
            bucket: "build".into(),
            access_key: "AK".into(),
            secret_key: "SK".into(),
            cache_path: tmp.path().join("cache.dat"),
            check_interval: Duration::from_secs(3),
            ..SyncConfig::default()
        };
        UpdateLoop::new(config, sink, Arc::new(NoConfirm)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn the_countdown_ticks_once_per_remaining_second() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let mut update_loop = test_loop(&tmp, Arc::clone(&sink));

        update_loop.countdown().await.unwrap();

        let seconds: Vec<u64> = sink
            .0
            .lock()
            .iter()
            .filter_map(|e| match e {
                SyncEvent::TimeRemaining { seconds } => Some(*seconds),
                _ => None,
            })
            .collect();
        assert_eq!(seconds, vec![3, 2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn an_overdue_client_update_check_replaces_the_countdown() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let mut update_loop = test_loop(&tmp, Arc::clone(&sink));
        tokio::time::advance(UPDATE_CHECK_INTERVAL).await;

        update_loop.countdown().await.unwrap();

        let events = sink.0.lock();
        assert!(matches!(events[..], [SyncEvent::UpdateCheckDue]));
    }

    #[tokio::test(start_paused = true)]
    async fn an_interrupt_stops_the_countdown() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let mut update_loop = test_loop(&tmp, Arc::clone(&sink));
        update_loop.exiting_flag().store(true, Ordering::SeqCst);

        assert!(matches!(
            update_loop.countdown().await,
            Err(SyncError::Interrupted)
        ));
    }
}
