use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use hashsync::config::{self, SyncConfig};
use hashsync::errors::{SyncError, SyncResult};
use hashsync::events::{ConsoleConfirmer, LogSink};
use hashsync::UpdateLoop;

/// Keeps a local directory in sync with a hash-manifest-published bucket.
#[derive(Parser)]
#[command(name = "hashsync", version)]
struct Cli {
    /// Directory to keep in sync
    #[arg(long, value_name = "PATH")]
    dir: PathBuf,

    /// URL of the hash manifest endpoint
    #[arg(long, value_name = "URL")]
    manifest_url: String,

    /// Bucket the files are published in
    #[arg(long)]
    bucket: String,

    /// Object-store host
    #[arg(long, default_value = "s3.amazonaws.com")]
    host: String,

    #[arg(long, default_value = "")]
    access_key: String,

    #[arg(long, default_value = "")]
    secret_key: String,

    /// Maximum simultaneous downloads
    #[arg(long, default_value_t = config::DEFAULT_MAX_CONCURRENCY)]
    concurrency: usize,

    /// Download speed cap in KB/s (-1 = unlimited)
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    max_speed: i64,

    /// Delete redundant files without asking for confirmation
    #[arg(long)]
    delete: bool,

    /// Never delete redundant files
    #[arg(long, conflicts_with = "delete")]
    no_delete: bool,

    /// Also delete files that were never published by a previous manifest
    #[arg(long)]
    delete_all: bool,

    /// Rehash every file instead of trusting the size+mtime shortcut
    #[arg(long)]
    verify: bool,

    /// Top-level directory excluded from downloads and deletion
    #[arg(long, value_name = "NAME")]
    exclude_dir: Option<String>,

    /// Run one sync cycle and exit instead of watching
    #[arg(long)]
    once: bool,

    /// Sync even while an application under the directory is running
    #[arg(long)]
    ignore_running: bool,

    /// Create the directory if it does not exist
    #[arg(long)]
    create_dir: bool,

    /// Seconds between periodic re-checks in watch mode
    #[arg(long, default_value_t = 180)]
    check_interval: u64,

    /// Location of the sync cache file
    #[arg(long, value_name = "PATH")]
    cache: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> SyncConfig {
        SyncConfig {
            local_directory: self.dir,
            manifest_url: self.manifest_url,
            bucket: self.bucket,
            host: self.host,
            access_key: self.access_key,
            secret_key: self.secret_key,
            max_concurrency: self.concurrency,
            max_bytes_per_sec: (self.max_speed > 0).then(|| self.max_speed as u64 * 1024),
            delete_without_asking: self.delete,
            no_delete: self.no_delete,
            delete_all: self.delete_all,
            verify: self.verify,
            exclude_dir: self.exclude_dir,
            once: self.once,
            ignore_running: self.ignore_running,
            create_directory: self.create_dir,
            cache_path: self.cache.unwrap_or_else(config::default_cache_path),
            check_interval: Duration::from_secs(self.check_interval),
            ..SyncConfig::default()
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    match run(cli.into_config()).await {
        Ok(()) | Err(SyncError::Interrupted) => {}
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    }
}

async fn run(config: SyncConfig) -> SyncResult<()> {
    config.validate()?;

    let mut update_loop =
        UpdateLoop::new(config, Arc::new(LogSink::new()), Arc::new(ConsoleConfirmer))?;

    let exiting = update_loop.exiting_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            exiting.store(true, Ordering::SeqCst);
        }
    });

    update_loop.run().await
}
