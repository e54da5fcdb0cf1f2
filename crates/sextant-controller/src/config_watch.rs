//! Reload the reconciler schedule from a mounted file.
//!
//! The schedule file is typically a ConfigMap mount. Kubelet replaces
//! the whole volume by re-pointing a `..data` symlink rather than
//! rewriting the file, so the watch goes on the directory and a
//! caller-supplied predicate decides which events matter.

use crate::cron::{Schedule, ScheduledJob};
use crate::error::Result;
use futures_util::StreamExt;
use inotify::{Event, EventMask, Inotify, WatchMask};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default mount point of the schedule ConfigMap.
pub const DEFAULT_SCHEDULE_PATH: &str = "/cron-schedule/schedule";

/// Predicate for ConfigMap-style mounts: the atomic commit point of an
/// update is the creation of the `..data` symlink.
pub fn configmap_update_predicate(event: &Event<OsString>) -> bool {
    event.mask.contains(EventMask::CREATE)
        && event.name.as_deref() == Some(OsStr::new("..data"))
}

/// Read the expression from the schedule file, trimming surrounding
/// whitespace. Unreadable or empty files are `None`.
pub async fn read_schedule_expression(path: &Path) -> Option<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let expression = contents.trim().to_string();
            if expression.is_empty() {
                None
            } else {
                Some(expression)
            }
        }
        Err(_) => None,
    }
}

/// Watch the schedule file's directory and re-apply the expression on
/// relevant changes. Watcher errors are logged and the loop continues;
/// the loop ends when the event stream closes or the token fires.
pub async fn watch_schedule_file<P>(
    path: PathBuf,
    job: Arc<ScheduledJob>,
    predicate: P,
    token: CancellationToken,
) -> Result<()>
where
    P: Fn(&Event<OsString>) -> bool + Send,
{
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let inotify = Inotify::init()?;
    inotify.watches().add(
        &dir,
        WatchMask::CREATE | WatchMask::MODIFY | WatchMask::MOVED_TO | WatchMask::DELETE,
    )?;
    let mut events = inotify.into_event_stream([0u8; 1024])?;
    info!(dir = %dir.display(), file = %path.display(), "watching schedule directory");

    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            maybe_event = events.next() => match maybe_event {
                None => {
                    info!("schedule watch stream closed");
                    return Ok(());
                }
                Some(Err(err)) => {
                    warn!(%err, "schedule watch error");
                    continue;
                }
                Some(Ok(event)) => {
                    if !predicate(&event) {
                        continue;
                    }
                    let Some(expression) = read_schedule_expression(&path).await else {
                        debug!(file = %path.display(), "schedule file missing or empty");
                        continue;
                    };
                    if expression == job.expression() {
                        debug!(%expression, "schedule unchanged");
                        continue;
                    }
                    match expression.parse::<Schedule>() {
                        Ok(schedule) => {
                            info!(%expression, "applying new reconciler schedule");
                            job.set_schedule(schedule);
                        }
                        Err(err) => warn!(%err, "ignoring malformed schedule file"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron::JobTask;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_file_change_reschedules_the_job() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("schedule");
        tokio::fs::write(&path, "0/1 2 3 * * *\n").await.unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&count);
        let task: JobTask = Arc::new(move || {
            let counted = Arc::clone(&counted);
            Box::pin(async move {
                counted.fetch_add(1, Ordering::SeqCst);
            })
        });

        let initial: Schedule = read_schedule_expression(&path)
            .await
            .unwrap()
            .parse()
            .unwrap();
        let job = ScheduledJob::new(initial, task);
        let token = CancellationToken::new();

        let runner = {
            let job = Arc::clone(&job);
            let token = token.clone();
            tokio::spawn(async move { job.run(token).await })
        };
        let watcher = {
            let job = Arc::clone(&job);
            let token = token.clone();
            let path = path.clone();
            tokio::spawn(async move {
                // Plain file writes in the test; match events on the
                // schedule file itself instead of `..data`.
                watch_schedule_file(
                    path,
                    job,
                    |event: &Event<OsString>| {
                        event.name.as_deref() == Some(OsStr::new("schedule"))
                    },
                    token,
                )
                .await
            })
        };

        // Give the watcher a moment to arm before changing the file.
        tokio::time::sleep(Duration::from_millis(200)).await;
        tokio::fs::write(&path, "0/1 * * * * *\n").await.unwrap();

        let mut fired = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if count.load(Ordering::SeqCst) > 0 {
                fired = true;
                break;
            }
        }
        token.cancel();
        let _ = runner.await;
        let _ = watcher.await;

        assert_eq!(job.expression(), "0/1 * * * * *");
        assert!(fired, "task did not fire after the schedule file changed");
    }

    #[tokio::test]
    async fn test_read_schedule_expression_trims() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("schedule");
        tokio::fs::write(&path, "  30 4 * * *  \n").await.unwrap();
        assert_eq!(
            read_schedule_expression(&path).await.as_deref(),
            Some("30 4 * * *")
        );

        tokio::fs::write(&path, "\n").await.unwrap();
        assert_eq!(read_schedule_expression(&path).await, None);
        assert_eq!(
            read_schedule_expression(&dir.path().join("missing")).await,
            None
        );
    }
}
