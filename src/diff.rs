//! Diffing local state against the remote manifest.
//!
//! Produces the set of files to download (absent locally or hash mismatch)
//! and the set of redundant local files to delete (present locally, absent
//! from the manifest). Both sides honor the configured excluded top-level
//! directory.

use std::path::Path;
use std::time::{Duration, Instant};

use crate::errors::SyncResult;
use crate::local::{list_relative_files, top_level_dir, LocalIndex};
use crate::manifest::Manifest;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// One queued download. `path` has no leading slash; joining it onto the
/// target directory yields the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub path: String,
    pub size: u64,
}

/// Hashes local files against the manifest and returns what needs to be
/// fetched. CPU-bound; callers run it on a blocking worker so in-flight
/// network callbacks and timers keep being serviced.
///
/// `progress` is invoked at most once per 100ms with (checked, total).
pub fn compute_downloads(
    manifest: &Manifest,
    root: &Path,
    index: &mut LocalIndex,
    exclude_dir: Option<&str>,
    force_rehash: bool,
    mut progress: impl FnMut(usize, usize),
) -> SyncResult<Vec<DownloadTask>> {
    let total = manifest.len();
    let mut to_download = Vec::new();
    let mut last_progress = Instant::now();

    for (i, (sub_path, entry)) in manifest.iter().enumerate() {
        if is_excluded(sub_path, exclude_dir) {
            continue;
        }

        let file_path = root.join(sub_path.trim_start_matches('/'));
        let needs_download = if file_path.is_file() {
            match index.hash_with_shortcut(root, sub_path, force_rehash) {
                Ok(hash) => hash != entry.hash,
                Err(err) => {
                    // Unreadable files get re-fetched rather than stalling
                    // the batch.
                    tracing::warn!("could not hash {sub_path}: {err}");
                    true
                }
            }
        } else {
            true
        };

        if needs_download {
            to_download.push(DownloadTask {
                path: sub_path.trim_start_matches('/').to_string(),
                size: entry.size,
            });
        }

        if last_progress.elapsed() >= PROGRESS_INTERVAL {
            progress(i + 1, total);
            last_progress = Instant::now();
        }
    }
    progress(total, total);
    Ok(to_download)
}

/// Local files that the manifest no longer publishes.
///
/// Unless `delete_all` is set, candidates are restricted to paths present in
/// the previously fetched manifest, so files the user added out-of-band are
/// never auto-deleted.
pub fn find_redundant_files(
    manifest: &Manifest,
    root: &Path,
    exclude_dir: Option<&str>,
    previous: Option<&Manifest>,
    delete_all: bool,
) -> Vec<String> {
    let mut candidates: Vec<String> = list_relative_files(root)
        .into_iter()
        .filter(|sub_path| !is_excluded(sub_path, exclude_dir))
        .filter(|sub_path| !manifest.contains_key(sub_path))
        .collect();

    if !delete_all {
        if let Some(previous) = previous {
            candidates.retain(|sub_path| previous.contains_key(sub_path));
        }
    }
    candidates
}

fn is_excluded(sub_path: &str, exclude_dir: Option<&str>) -> bool {
    exclude_dir.is_some_and(|dir| top_level_dir(sub_path) == dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestEntry;

    fn entry(size: u64, hash: &str) -> ManifestEntry {
        ManifestEntry {
            size,
            time: "2024-03-01 11:59:00".into(),
            hash: hash.into(),
        }
    }

    #[test]
    fn absent_files_are_scheduled_for_download() {
        let tmp = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::new();
        manifest.insert("/a.txt".into(), entry(10, "0123456789abcdef0123456789abcdef"));

        let mut index = LocalIndex::default();
        let tasks =
            compute_downloads(&manifest, tmp.path(), &mut index, None, false, |_, _| {}).unwrap();
        assert_eq!(
            tasks,
            vec![DownloadTask {
                path: "a.txt".into(),
                size: 10
            }]
        );

        let deletions = find_redundant_files(&manifest, tmp.path(), None, None, false);
        assert!(deletions.is_empty());
    }

    #[test]
    fn matching_hashes_are_skipped_and_mismatches_downloaded() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("same.txt"), b"hello world").unwrap();
        std::fs::write(tmp.path().join("changed.txt"), b"old bytes").unwrap();

        let mut manifest = Manifest::new();
        // MD5 of "hello world".
        manifest.insert("/same.txt".into(), entry(11, "5eb63bbbe01eeed093cb22bb8f5acdc3"));
        manifest.insert("/changed.txt".into(), entry(9, "ffffffffffffffffffffffffffffffff"));

        let mut index = LocalIndex::default();
        let tasks =
            compute_downloads(&manifest, tmp.path(), &mut index, None, false, |_, _| {}).unwrap();
        assert_eq!(
            tasks,
            vec![DownloadTask {
                path: "changed.txt".into(),
                size: 9
            }]
        );
    }

    #[test]
    fn excluded_directory_is_invisible_to_both_sides() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join(".excludes")).unwrap();
        std::fs::write(tmp.path().join(".excludes/mod.txt"), b"local-only").unwrap();

        let mut manifest = Manifest::new();
        manifest.insert(
            "/.excludes/server.txt".into(),
            entry(4, "0123456789abcdef0123456789abcdef"),
        );

        let mut index = LocalIndex::default();
        let tasks = compute_downloads(
            &manifest,
            tmp.path(),
            &mut index,
            Some(".excludes"),
            false,
            |_, _| {},
        )
        .unwrap();
        assert!(tasks.is_empty());

        let deletions =
            find_redundant_files(&manifest, tmp.path(), Some(".excludes"), None, true);
        assert!(deletions.is_empty());
    }

    #[test]
    fn out_of_band_files_survive_unless_delete_all() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("was_published.txt"), b"x").unwrap();
        std::fs::write(tmp.path().join("user_added.txt"), b"y").unwrap();

        let manifest = Manifest::new();
        let mut previous = Manifest::new();
        previous.insert(
            "/was_published.txt".into(),
            entry(1, "0123456789abcdef0123456789abcdef"),
        );

        let restricted =
            find_redundant_files(&manifest, tmp.path(), None, Some(&previous), false);
        assert_eq!(restricted, vec!["/was_published.txt".to_string()]);

        let aggressive =
            find_redundant_files(&manifest, tmp.path(), None, Some(&previous), true);
        assert_eq!(
            aggressive,
            vec!["/user_added.txt".to_string(), "/was_published.txt".to_string()]
        );
    }
}
