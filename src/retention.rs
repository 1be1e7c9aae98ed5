//! Periodic removal of stale files from the downloads directory.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::SystemTime,
};

use tokio::{task::JoinHandle, time::Duration};
use tracing::{debug, info, warn};

use crate::progress::ProgressTable;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub failed: usize,
}

/// Deletes every entry of `dir` last modified more than `max_age` ago.
/// Errors are logged and counted, never returned.
pub async fn sweep(dir: &Path, max_age: Duration) -> SweepReport {
    let mut report = SweepReport::default();

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("could not open {:?} for sweeping: {error}", dir);
            }
            return report;
        }
    };

    let now = SystemTime::now();

    loop {
        let maybe_entry = match entries.next_entry().await {
            Ok(value) => value,
            Err(error) => {
                warn!("could not list {:?} while sweeping: {error}", dir);
                break;
            }
        };

        let Some(entry) = maybe_entry else {
            break;
        };

        sweep_entry(&entry.path(), now, max_age, &mut report).await;
    }

    report
}

// The entry may vanish between listing and stat or remove; that is not a failure.
async fn sweep_entry(path: &Path, now: SystemTime, max_age: Duration, report: &mut SweepReport) {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return,
        Err(error) => {
            warn!("could not stat {:?}: {error}", path);
            report.failed += 1;
            return;
        }
    };

    let modified_at = match metadata.modified() {
        Ok(value) => value,
        Err(error) => {
            warn!("could not read modification time of {:?}: {error}", path);
            report.failed += 1;
            return;
        }
    };

    // A clock step backwards makes the file look new; keep it.
    let age = now.duration_since(modified_at).unwrap_or_default();
    if age <= max_age {
        return;
    }

    let removed = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };

    match removed {
        Ok(()) => {
            debug!("removed stale {:?} ({}s old)", path, age.as_secs());
            report.removed += 1;
        }
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => {
            warn!("could not remove stale {:?}: {error}", path);
            report.failed += 1;
        }
    }
}

/// Removes one file, treating a file that is already gone as success.
pub async fn remove_file_if_present(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await
        && error.kind() != ErrorKind::NotFound
    {
        warn!("could not remove {:?}: {error}", path);
    }
}

/// Runs [`sweep`] every `interval` and drops expired progress records on the
/// same tick. The first tick fires one full interval after spawning.
pub fn spawn_sweeper(
    dir: PathBuf,
    interval: Duration,
    max_age: Duration,
    progress: ProgressTable,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let report = sweep(&dir, max_age).await;
            let evicted = progress.evict_expired();
            if report.removed > 0 || report.failed > 0 || evicted > 0 {
                info!(
                    removed = report.removed,
                    failed = report.failed,
                    evicted_progress = evicted,
                    "retention sweep finished"
                );
            }
        }
    })
}
