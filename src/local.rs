//! Local file metadata: hashing, the staleness shortcut, and directory
//! enumeration.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::UNIX_EPOCH;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::errors::SyncResult;

const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// What we last observed about one local file, keyed elsewhere by its
/// `/`-prefixed relative path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub size: u64,
    pub mtime: i64,
    pub hash: String,
}

/// Streaming MD5 of a file, as a lowercase hex string.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Map of relative path to [`FileRecord`], with the staleness shortcut:
/// when size and mtime are unchanged since the last hash, the cached hash is
/// trusted and the file is not re-read.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalIndex {
    records: HashMap<String, FileRecord>,
}

impl LocalIndex {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, sub_path: &str) -> Option<&FileRecord> {
        self.records.get(sub_path)
    }

    pub fn insert(&mut self, sub_path: String, record: FileRecord) {
        self.records.insert(sub_path, record);
    }

    pub fn remove(&mut self, sub_path: &str) -> Option<FileRecord> {
        self.records.remove(sub_path)
    }

    /// Hash of the file at `root + sub_path`, recomputed only when the
    /// shortcut does not apply (or `force` is set). Updates the record.
    pub fn hash_with_shortcut(
        &mut self,
        root: &Path,
        sub_path: &str,
        force: bool,
    ) -> SyncResult<String> {
        let file_path = root.join(sub_path.trim_start_matches('/'));
        let metadata = std::fs::metadata(&file_path)?;
        let size = metadata.len();
        let mtime = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        if !force {
            if let Some(record) = self.records.get(sub_path) {
                if record.size == size && record.mtime == mtime {
                    return Ok(record.hash.clone());
                }
            }
        }

        let hash = hash_file(&file_path)?;
        self.records.insert(
            sub_path.to_string(),
            FileRecord {
                size,
                mtime,
                hash: hash.clone(),
            },
        );
        Ok(hash)
    }
}

/// Enumerates the files below `root` as `/`-prefixed relative paths with
/// forward slashes, the same form the manifest keys use.
pub fn list_relative_files(root: &Path) -> Vec<String> {
    let mut paths = Vec::new();
    for entry in walkdir::WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let mut sub_path = String::from("/");
        sub_path.push_str(&relative.to_string_lossy().replace('\\', "/"));
        paths.push(sub_path);
    }
    paths.sort();
    paths
}

/// Top-level directory name of a `/`-prefixed relative path.
pub fn top_level_dir(sub_path: &str) -> &str {
    let trimmed = sub_path.trim_start_matches('/');
    trimmed.split('/').next().unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn hashes_are_lowercase_hex_md5() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.txt");
        std::fs::write(&path, b"hello world").unwrap();
        // Well-known digest of "hello world".
        assert_eq!(hash_file(&path).unwrap(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn unchanged_size_and_mtime_skip_the_rehash() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f.bin");
        std::fs::write(&path, b"aaaa").unwrap();

        let mut index = LocalIndex::default();
        let first = index.hash_with_shortcut(tmp.path(), "/f.bin", false).unwrap();

        // Rewrite the content but restore size and mtime; the shortcut must
        // keep returning the cached hash even though the bytes changed.
        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
        let mut file = File::create(&path).unwrap();
        file.write_all(b"bbbb").unwrap();
        drop(file);
        filetime::set_file_mtime(&path, filetime::FileTime::from_system_time(mtime)).unwrap();

        let second = index.hash_with_shortcut(tmp.path(), "/f.bin", false).unwrap();
        assert_eq!(first, second);

        // Forcing a verify pass recomputes.
        let third = index.hash_with_shortcut(tmp.path(), "/f.bin", true).unwrap();
        assert_ne!(first, third);
    }

    #[test]
    fn size_change_invalidates_the_shortcut() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f.bin");
        std::fs::write(&path, b"aaaa").unwrap();

        let mut index = LocalIndex::default();
        let first = index.hash_with_shortcut(tmp.path(), "/f.bin", false).unwrap();
        std::fs::write(&path, b"aaaaaa").unwrap();
        let second = index.hash_with_shortcut(tmp.path(), "/f.bin", false).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn listing_uses_slash_prefixed_forward_slash_paths() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("maps")).unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"x").unwrap();
        std::fs::write(tmp.path().join("maps/b.bin"), b"y").unwrap();

        let listed = list_relative_files(tmp.path());
        assert_eq!(listed, vec!["/a.txt".to_string(), "/maps/b.bin".to_string()]);
    }

    #[test]
    fn top_level_dir_extraction() {
        assert_eq!(top_level_dir("/.excludes/x/y"), ".excludes");
        assert_eq!(top_level_dir("/a.txt"), "a.txt");
    }

}
