//! Background disk sweep daemon.
//!
//! Periodically runs the two-pass sweep over a namespace directory until
//! cancelled. Applications embed this next to their runtime; the cache
//! itself never starts it implicitly.
//!
//! # Usage
//!
//! ```ignore
//! use tokio_util::sync::CancellationToken;
//! use webimage::cache::daemon::run_sweep_daemon;
//!
//! let cancellation = CancellationToken::new();
//! tokio::spawn(run_sweep_daemon(
//!     cache.namespace_dir().to_path_buf(),
//!     config.max_cache_age,
//!     config.max_cache_size,
//!     std::time::Duration::from_secs(300),
//!     cancellation.clone(),
//! ));
//! ```

use crate::cache::sweep::{sweep, SweepResult};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Run the sweep daemon until the token is cancelled.
///
/// One sweep runs immediately on startup, then one per interval.
pub async fn run_sweep_daemon(
    dir: PathBuf,
    max_age: Duration,
    max_size: u64,
    interval: Duration,
    cancellation: CancellationToken,
) {
    info!(
        dir = %dir.display(),
        max_age_secs = max_age.as_secs(),
        max_size_bytes = max_size,
        interval_secs = interval.as_secs(),
        "starting disk sweep daemon"
    );

    sweep_blocking(dir.clone(), max_age, max_size).await;

    loop {
        tokio::select! {
            _ = cancellation.cancelled() => {
                info!("disk sweep daemon shutting down");
                break;
            }
            _ = tokio::time::sleep(interval) => {
                sweep_blocking(dir.clone(), max_age, max_size).await;
            }
        }
    }
}

/// Run one sweep on the blocking pool.
async fn sweep_blocking(dir: PathBuf, max_age: Duration, max_size: u64) -> SweepResult {
    let result = tokio::task::spawn_blocking(move || sweep(&dir, max_age, max_size))
        .await
        .unwrap_or_default();

    if result.files_deleted() == 0 {
        debug!(remaining_size = result.remaining_size, "sweep found nothing to delete");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use std::fs;
    use std::time::SystemTime;
    use tempfile::TempDir;

    const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    #[tokio::test]
    async fn test_daemon_sweeps_on_startup() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("stale");
        fs::write(&path, vec![0u8; 100]).unwrap();
        let mtime = SystemTime::now() - Duration::from_secs(30 * 24 * 60 * 60);
        filetime::set_file_mtime(&path, FileTime::from_system_time(mtime)).unwrap();

        let cancellation = CancellationToken::new();
        let daemon = tokio::spawn(run_sweep_daemon(
            temp.path().to_path_buf(),
            WEEK,
            0,
            Duration::from_secs(3600),
            cancellation.clone(),
        ));

        // The startup sweep runs before the first sleep.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!path.exists());

        cancellation.cancel();
        daemon.await.unwrap();
    }

    #[tokio::test]
    async fn test_daemon_stops_on_cancellation() {
        let temp = TempDir::new().unwrap();
        let cancellation = CancellationToken::new();

        let daemon = tokio::spawn(run_sweep_daemon(
            temp.path().to_path_buf(),
            WEEK,
            0,
            Duration::from_secs(3600),
            cancellation.clone(),
        ));

        cancellation.cancel();
        tokio::time::timeout(Duration::from_secs(2), daemon)
            .await
            .expect("daemon should exit promptly after cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn test_sweep_blocking_returns_result() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("fresh"), vec![0u8; 50]).unwrap();

        let result = sweep_blocking(temp.path().to_path_buf(), WEEK, 0).await;

        assert_eq!(result.files_deleted(), 0);
        assert_eq!(result.remaining_size, 50);
    }
}
