//! Progress notifications and the confirmation collaborator.
//!
//! The core emits named events instead of logging directly so a console
//! logger and an IPC bridge can both subscribe. Delivery is fire-and-forget;
//! the only interaction the core ever waits on is the delete confirmation,
//! which goes through [`DeleteConfirmer`].

use std::io::Write;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// One notification from the sync engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    CheckingForUpdates,
    DownloadingManifest,
    UpToDate,
    CheckingFiles,
    HashingProgress {
        checked: usize,
        total: usize,
    },
    WaitingForProcesses {
        names: Vec<String>,
    },
    DeleteConfirmationRequested {
        count: usize,
    },
    SyncStarted {
        total_bytes: u64,
    },
    /// Fires at most once per 100ms measurement tick while downloads run.
    SyncStatus {
        percent: f64,
        active: usize,
        incomplete: usize,
        bytes_downloaded: u64,
        speed_bps: f64,
        seconds_remaining: Option<u64>,
    },
    SyncComplete {
        files_downloaded: usize,
        elapsed: Duration,
    },
    TimeRemaining {
        seconds: u64,
    },
    /// The 30-minute self-update cadence elapsed; acting on it is the
    /// launcher's job, not ours.
    UpdateCheckDue,
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: SyncEvent);
}

const PROGRESS_LINE_INTERVAL: Duration = Duration::from_secs(1);

/// Console sink: renders events as log lines the way the interactive tool
/// always has. The engine ticks progress up to ten times a second; the
/// console line renders at most once a second.
pub struct LogSink {
    last_progress_line: Mutex<Option<Instant>>,
}

impl LogSink {
    pub fn new() -> Self {
        Self {
            last_progress_line: Mutex::new(None),
        }
    }

    fn progress_line_due(&self) -> bool {
        let mut last = self.last_progress_line.lock();
        match *last {
            Some(at) if at.elapsed() < PROGRESS_LINE_INTERVAL => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for LogSink {
    fn emit(&self, event: SyncEvent) {
        match event {
            SyncEvent::CheckingForUpdates => tracing::info!("Checking for updates..."),
            SyncEvent::DownloadingManifest => tracing::info!("Downloading new file hashes..."),
            SyncEvent::UpToDate => tracing::info!("All files are up to date"),
            SyncEvent::CheckingFiles => tracing::info!("Checking files..."),
            SyncEvent::HashingProgress { checked, total } => {
                if self.progress_line_due() {
                    let percent = checked as f64 / total.max(1) as f64 * 100.0;
                    tracing::info!("Checked {checked}/{total} files ({percent:.2}%)");
                }
            }
            SyncEvent::WaitingForProcesses { names } => tracing::warn!(
                "Updating will only start once the following application(s) have been closed: {}",
                names.join(", ")
            ),
            SyncEvent::DeleteConfirmationRequested { count } => {
                tracing::info!("Requesting confirmation to delete {count} files");
            }
            SyncEvent::SyncStarted { total_bytes } => {
                tracing::info!("Downloading {} of data...", human_readable_bytes(total_bytes));
            }
            SyncEvent::SyncStatus {
                percent,
                active,
                incomplete,
                speed_bps,
                seconds_remaining,
                ..
            } => {
                if self.progress_line_due() {
                    tracing::info!(
                        "{percent:.2}% - downloading {active}/{incomplete} file(s) concurrently - {:.2} KB/s{}",
                        speed_bps / 1024.0,
                        seconds_remaining
                            .map(|s| format!(" - about {s}s remaining"))
                            .unwrap_or_default()
                    );
                }
            }
            SyncEvent::SyncComplete {
                files_downloaded,
                elapsed,
            } => tracing::info!(
                "Sync complete. {files_downloaded} files downloaded in {:.1}s.",
                elapsed.as_secs_f64()
            ),
            SyncEvent::TimeRemaining { seconds } => {
                if seconds % 60 == 0 {
                    tracing::debug!("Next check in {}s", seconds);
                }
            }
            SyncEvent::UpdateCheckDue => tracing::debug!("Client update check is due"),
        }
    }
}

/// Answers a delete-confirmation request with a single boolean.
///
/// When a frontend is attached it answers over IPC; without one the console
/// prompt below is used.
pub trait DeleteConfirmer: Send + Sync {
    fn confirm(&self, count: usize) -> bool;
}

/// Interactive console prompt. Accepts `y`/`ye`/`yes` and `n`/`no`
/// case-insensitively and re-prompts on anything else.
pub struct ConsoleConfirmer;

impl DeleteConfirmer for ConsoleConfirmer {
    fn confirm(&self, count: usize) -> bool {
        loop {
            print!("Are you sure you want to delete {count} files? [Y/N] ");
            let _ = std::io::stdout().flush();
            let mut line = String::new();
            if std::io::stdin().read_line(&mut line).is_err() {
                return false;
            }
            match parse_yes_no(&line) {
                Some(answer) => return answer,
                None => continue,
            }
        }
    }
}

pub(crate) fn parse_yes_no(input: &str) -> Option<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "y" | "ye" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

pub fn human_readable_bytes(bytes: u64) -> String {
    let mut size = bytes as f64;
    let mut unit = "bytes";
    for next in ["KB", "MB", "GB"] {
        if size < 1024.0 {
            break;
        }
        size /= 1024.0;
        unit = next;
    }
    format!("{size:.2} {unit}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yes_no_parsing_matches_the_interactive_prompt() {
        for yes in ["y", "Y", "ye", "yes", "YES", " yes \n"] {
            assert_eq!(parse_yes_no(yes), Some(true), "{yes:?}");
        }
        for no in ["n", "N", "no", "NO"] {
            assert_eq!(parse_yes_no(no), Some(false), "{no:?}");
        }
        for junk in ["", "maybe", "yess", "nope", "q"] {
            assert_eq!(parse_yes_no(junk), None, "{junk:?}");
        }
    }

    #[test]
    fn byte_sizes_render_with_two_decimals() {
        assert_eq!(human_readable_bytes(512), "512.00 bytes");
        assert_eq!(human_readable_bytes(20 * 1024 * 1024), "20.00 MB");
    }

    #[test]
    fn console_progress_lines_render_at_most_once_per_second() {
        let sink = LogSink::new();
        // First line always renders; anything inside the same second is
        // suppressed no matter how fast the engine ticks.
        assert!(sink.progress_line_due());
        assert!(!sink.progress_line_due());
        assert!(!sink.progress_line_due());
    }
}
