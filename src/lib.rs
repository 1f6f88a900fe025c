//! Keeps a local directory synchronized with an S3-compatible bucket, driven
//! by a server-published manifest of per-file MD5 hashes.
//!
//! The engine fetches the manifest (conditionally, so an unchanged server
//! costs one HEAD), diffs it against the local tree using a size+mtime
//! shortcut to avoid rehashing unchanged files, downloads what differs with
//! bounded concurrency and an aggregate bandwidth cap, deletes what the
//! server no longer publishes, and repeats on a timer. Progress leaves
//! through [`events::EventSink`]; the interactive binary in `main.rs` is one
//! consumer, a GUI bridge can be another.

pub mod cache;
pub mod config;
pub mod deleter;
pub mod diff;
pub mod downloader;
pub mod errors;
pub mod events;
pub mod local;
pub mod manifest;
pub mod process;
pub mod remote;
pub mod update_loop;

pub use config::SyncConfig;
pub use errors::{SyncError, SyncResult};
pub use events::{DeleteConfirmer, EventSink, SyncEvent};
pub use update_loop::UpdateLoop;
