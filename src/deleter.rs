//! The deletion workflow.
//!
//! Removes local files the manifest no longer publishes, asking for
//! confirmation first when the batch is larger than the configured
//! threshold. The builder-side variant removes the corresponding bucket
//! objects instead.

use std::path::Path;

use futures::stream::{self, StreamExt};

use crate::events::{DeleteConfirmer, EventSink, SyncEvent};
use crate::local::LocalIndex;
use crate::remote::ObjectStore;

const REMOTE_DELETE_ATTEMPTS: u32 = 5;
const REMOTE_DELETE_CONCURRENCY: usize = 8;

/// Deletes redundant local files and drops their cache records.
///
/// Batches above `threshold` require a confirmation unless
/// `delete_without_asking` is set; a declined confirmation leaves every file
/// in place. A file already missing from disk is logged, not an error, and
/// its record is still dropped. Returns the number of files removed.
pub fn delete_local_files(
    candidates: &[String],
    root: &Path,
    index: &mut LocalIndex,
    threshold: usize,
    delete_without_asking: bool,
    sink: &dyn EventSink,
    confirmer: &dyn DeleteConfirmer,
) -> usize {
    if candidates.is_empty() {
        return 0;
    }
    if candidates.len() > threshold && !delete_without_asking {
        sink.emit(SyncEvent::DeleteConfirmationRequested {
            count: candidates.len(),
        });
        if !confirmer.confirm(candidates.len()) {
            tracing::info!("keeping {} redundant files", candidates.len());
            return 0;
        }
    }

    let mut deleted = 0;
    for sub_path in candidates {
        let path = root.join(sub_path.trim_start_matches('/'));
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!("deleted redundant file {sub_path}");
                deleted += 1;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("{sub_path} was already gone");
            }
            Err(err) => {
                tracing::warn!("could not delete {sub_path}: {err}");
            }
        }
        index.remove(sub_path);
    }
    deleted
}

/// Removes bucket objects with bounded concurrency and per-object retry.
/// Objects succeed or fail independently; returns how many were removed.
pub async fn delete_remote_objects(store: &ObjectStore, paths: &[String]) -> usize {
    stream::iter(paths)
        .map(|path| async move {
            for attempt in 1..=REMOTE_DELETE_ATTEMPTS {
                match store.delete(path).await {
                    Ok(()) => {
                        tracing::info!("deleted remote object {path}");
                        return true;
                    }
                    Err(err) if attempt < REMOTE_DELETE_ATTEMPTS => {
                        tracing::warn!(
                            "DELETE {path} - attempt #{attempt} failed ({err}), retrying..."
                        );
                    }
                    Err(err) => {
                        tracing::warn!(
                            "DELETE {path} - all {REMOTE_DELETE_ATTEMPTS} attempts failed: {err}"
                        );
                        return false;
                    }
                }
            }
            false
        })
        .buffer_unordered(REMOTE_DELETE_CONCURRENCY)
        .filter(|removed| futures::future::ready(*removed))
        .count()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::FileRecord;

    struct NullSink;
    impl EventSink for NullSink {
        fn emit(&self, _event: SyncEvent) {}
    }

    /// Fails the test if the workflow asks at all.
    struct NeverAsked;
    impl DeleteConfirmer for NeverAsked {
        fn confirm(&self, _count: usize) -> bool {
            panic!("confirmation must not be requested below the threshold");
        }
    }

    struct Answer(bool);
    impl DeleteConfirmer for Answer {
        fn confirm(&self, _count: usize) -> bool {
            self.0
        }
    }

    fn record() -> FileRecord {
        FileRecord {
            size: 1,
            mtime: 0,
            hash: "0123456789abcdef0123456789abcdef".into(),
        }
    }

    #[test]
    fn small_batches_are_deleted_without_prompting() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("stale.txt"), b"x").unwrap();
        let mut index = LocalIndex::default();
        index.insert("/stale.txt".into(), record());

        let deleted = delete_local_files(
            &["/stale.txt".into()],
            tmp.path(),
            &mut index,
            50,
            false,
            &NullSink,
            &NeverAsked,
        );
        assert_eq!(deleted, 1);
        assert!(!tmp.path().join("stale.txt").exists());
        assert!(index.get("/stale.txt").is_none());
    }

    #[test]
    fn declined_confirmation_leaves_everything_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let candidates: Vec<String> = (0..3)
            .map(|i| {
                let name = format!("f{i}.txt");
                std::fs::write(tmp.path().join(&name), b"x").unwrap();
                format!("/{name}")
            })
            .collect();
        let mut index = LocalIndex::default();

        let deleted = delete_local_files(
            &candidates,
            tmp.path(),
            &mut index,
            2,
            false,
            &NullSink,
            &Answer(false),
        );
        assert_eq!(deleted, 0);
        assert!(tmp.path().join("f0.txt").exists());
    }

    #[test]
    fn delete_without_asking_bypasses_the_threshold() {
        let tmp = tempfile::tempdir().unwrap();
        let candidates: Vec<String> = (0..3)
            .map(|i| {
                let name = format!("f{i}.txt");
                std::fs::write(tmp.path().join(&name), b"x").unwrap();
                format!("/{name}")
            })
            .collect();
        let mut index = LocalIndex::default();

        let deleted = delete_local_files(
            &candidates,
            tmp.path(),
            &mut index,
            2,
            true,
            &NullSink,
            &NeverAsked,
        );
        assert_eq!(deleted, 3);
    }

    #[test]
    fn a_file_already_gone_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut index = LocalIndex::default();
        index.insert("/ghost.txt".into(), record());

        let deleted = delete_local_files(
            &["/ghost.txt".into()],
            tmp.path(),
            &mut index,
            50,
            false,
            &NullSink,
            &NeverAsked,
        );
        assert_eq!(deleted, 0);
        // The stale record is still dropped.
        assert!(index.get("/ghost.txt").is_none());
    }
}
