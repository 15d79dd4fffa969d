use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::{LauncherError, Result};
use crate::models::{CleanupStatus, FrameStatus, Notification, TaskError, TaskState, TaskStatus};
use crate::parse_url::{self, LaunchRequest};
use crate::preferences::{Preferences, PreferencesStore};
use crate::services::metadata_service::RateLimiter;
use crate::services::{DownloadManager, LaunchService, MetadataService, NotificationHub};
use crate::store::TaskStore;

/// Tuning knobs for the core. Production defaults match the limits the
/// archive service tolerates.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    /// Maximum simultaneous file transfers, shared across all tasks.
    pub download_limit: usize,
    /// Metadata request starts admitted per rate window.
    pub metadata_rate_limit: u32,
    pub metadata_rate_interval: Duration,
    /// How long a finished task stays addressable before self-deleting.
    pub retain_done_for: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            download_limit: 10,
            metadata_rate_limit: 10,
            metadata_rate_interval: Duration::from_millis(200),
            retain_done_for: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
struct TaskHandle {
    cancel: CancellationToken,
    settled: watch::Receiver<bool>,
}

/// Drives one task per incoming URL through validate → fetch metadata →
/// download → launch → cleanup, owns cancellation and the task registry.
#[derive(Clone)]
pub struct TaskManager {
    store: TaskStore,
    prefs: PreferencesStore,
    notifications: NotificationHub,
    metadata: MetadataService,
    downloads: DownloadManager,
    launcher: LaunchService,
    registry: Arc<Mutex<HashMap<String, TaskHandle>>>,
    retain_done_for: Duration,
}

impl TaskManager {
    pub fn new(
        store: TaskStore,
        prefs: PreferencesStore,
        notifications: NotificationHub,
        config: CoreConfig,
    ) -> Self {
        let client = reqwest::Client::new();
        let limiter = RateLimiter::new(config.metadata_rate_limit, config.metadata_rate_interval);
        let permits = Arc::new(Semaphore::new(config.download_limit.max(1)));
        Self {
            metadata: MetadataService::new(client.clone(), store.clone(), limiter),
            downloads: DownloadManager::new(client, store.clone(), permits),
            launcher: LaunchService::new(store.clone()),
            store,
            prefs,
            notifications,
            registry: Arc::new(Mutex::new(HashMap::new())),
            retain_done_for: config.retain_done_for,
        }
    }

    /// Validates the URL and starts a task for it in the background. A
    /// validation failure produces a notification (with the token redacted)
    /// and creates no task.
    pub fn submit_url(&self, url: &str) -> Result<String> {
        let request = match parse_url::parse(url) {
            Ok(request) => request,
            Err(err) => {
                self.notifications.send(Notification::danger(
                    "Invalid",
                    format!("{}\n{}", parse_url::display_url(url), err),
                ));
                return Err(err);
            }
        };

        let id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let (settled_tx, settled_rx) = watch::channel(false);
        self.lock_registry().insert(
            id.clone(),
            TaskHandle {
                cancel: cancel.clone(),
                settled: settled_rx,
            },
        );

        info!("task {} created for {}", id, parse_url::display_url(url));

        let manager = self.clone();
        let task_id = id.clone();
        tokio::spawn(async move {
            manager.run(task_id, request, cancel, settled_tx).await;
        });

        Ok(id)
    }

    /// Requests a cooperative abort. A second abort of the same task is a
    /// no-op; unknown ids are an error.
    pub fn abort_task(&self, id: &str) -> Result<()> {
        let handle = self
            .handle(id)
            .ok_or_else(|| LauncherError::NotFound(format!("task {}", id)))?;
        if handle.cancel.is_cancelled() {
            return Ok(());
        }

        let terminal = self
            .store
            .get(id)
            .map(|task| task.status.is_terminal())
            .unwrap_or(false);
        if !terminal {
            self.store.update(id, |task| {
                task.status = TaskStatus::Aborting;
            });
        }
        handle.cancel.cancel();
        Ok(())
    }

    /// Aborts the task (idempotent), waits for its run to fully settle, then
    /// removes it from the store and registry.
    pub async fn delete_task(&self, id: &str) -> Result<()> {
        let handle = self
            .handle(id)
            .ok_or_else(|| LauncherError::NotFound(format!("task {}", id)))?;
        self.abort_task(id)?;

        let mut settled = handle.settled.clone();
        while !*settled.borrow() {
            if settled.changed().await.is_err() {
                break;
            }
        }

        self.lock_registry().remove(id);
        self.store.remove(id);
        Ok(())
    }

    async fn run(
        &self,
        id: String,
        request: LaunchRequest,
        cancel: CancellationToken,
        settled: watch::Sender<bool>,
    ) {
        let result = self.main_then_cleanup(&id, &request, &cancel).await;

        match result {
            Ok(()) => {
                self.store.update(&id, |task| {
                    task.status = TaskStatus::Done;
                });
                info!("task {} done", id);

                // self-delete later so finished tasks don't pile up in memory
                let manager = self.clone();
                let task_id = id.clone();
                let delay = self.retain_done_for;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = manager.delete_task(&task_id).await;
                });
            }
            Err(err) => {
                let aborted = err.is_cancelled() && cancel.is_cancelled();
                self.store.update(&id, |task| {
                    task.error = Some(TaskError::from_error(&err));
                    task.status = if aborted {
                        TaskStatus::Aborted
                    } else {
                        TaskStatus::Failed
                    };
                });
                if aborted {
                    info!("task {} aborted", id);
                } else {
                    warn!("task {} failed: {}", id, err);
                }
            }
        }

        let _ = settled.send(true);
    }

    /// Cleanup runs exactly once after the main phases, whatever the outcome.
    async fn main_then_cleanup(
        &self,
        id: &str,
        request: &LaunchRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let result = self.main(id, request, cancel).await;
        self.cleanup(id).await;
        result
    }

    async fn main(
        &self,
        id: &str,
        request: &LaunchRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // Frame ids are unique within a task; a URL listing the same id
        // twice still yields one item, one download and one viewer argument.
        let frame_ids = unique_frame_ids(&request.frame_ids);

        self.store.insert(TaskState::new(
            id,
            request.raw.as_str(),
            parse_url::display_url(request.raw.as_str()),
            frame_ids.clone(),
        ));

        let prefs = self.prefs.get();

        if prefs.custom_download_dir.enabled && !prefs.custom_download_dir.cleanup {
            self.store.update(id, |task| {
                task.cleanup = CleanupStatus::Skip;
            });
        }

        // Exit early when the DS9 path has never been configured, and tell
        // the user what to do about it.
        if prefs.ds9.path.is_empty() {
            self.notifications.send(Notification::danger(
                "Preferences",
                "Set a valid path to the DS9 executable.",
            ));
            return Err(LauncherError::Launch(
                "DS9 executable path not set".to_string(),
            ));
        }

        let download_dir = ensure_download_dir(&prefs, id).await?;
        self.store.update(id, |task| {
            task.download_dir = Some(download_dir.clone());
        });

        ensure_ds9(&prefs).await?;

        self.metadata
            .fetch_all(request, &frame_ids, id, cancel)
            .await?;
        self.downloads
            .download_all(&download_dir, id, &frame_ids, cancel)
            .await?;
        self.launcher.launch(&prefs, id, cancel).await?;

        self.store.update(id, |task| {
            task.status = TaskStatus::Closed;
        });

        Ok(())
    }

    /// Best-effort: a cleanup failure is recorded without reopening the main
    /// phases' terminal status.
    async fn cleanup(&self, id: &str) {
        if let Err(err) = self.try_cleanup(id).await {
            warn!("cleanup for task {} failed: {}", id, err);
            self.store.update(id, |task| {
                task.cleanup = CleanupStatus::Failed;
            });
        }
    }

    async fn try_cleanup(&self, id: &str) -> Result<()> {
        let Some(task) = self.store.get(id) else {
            return Ok(());
        };

        if task.cleanup == CleanupStatus::Skip {
            self.store.update(id, |task| {
                task.cleanup = CleanupStatus::Skipped;
            });
            return Ok(());
        }

        let Some(download_dir) = task.download_dir else {
            self.store.update(id, |task| {
                task.cleanup = CleanupStatus::Done;
            });
            return Ok(());
        };

        self.store.update(id, |task| {
            task.cleanup = CleanupStatus::Attempting;
        });

        match tokio::fs::remove_dir_all(&download_dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(LauncherError::Cleanup(format!(
                    "cannot remove {:?}: {}",
                    download_dir, err
                )))
            }
        }

        self.store.update(id, |task| {
            for frame in task.frames.values_mut() {
                frame.status = FrameStatus::Deleted;
            }
            task.cleanup = CleanupStatus::Done;
        });

        Ok(())
    }

    fn handle(&self, id: &str) -> Option<TaskHandle> {
        self.lock_registry().get(id).cloned()
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, TaskHandle>> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn unique_frame_ids(frame_ids: &[String]) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(frame_ids.len());
    for id in frame_ids {
        if !unique.contains(id) {
            unique.push(id.clone());
        }
    }
    unique
}

async fn ensure_download_dir(prefs: &Preferences, suffix: &str) -> Result<PathBuf> {
    let base = if prefs.custom_download_dir.enabled {
        PathBuf::from(&prefs.custom_download_dir.path)
    } else {
        std::env::temp_dir().join("ds9-launcher")
    };

    if base.as_os_str().is_empty() {
        return Err(LauncherError::Config(
            "download directory must not be empty".to_string(),
        ));
    }
    if !base.is_absolute() {
        return Err(LauncherError::Config(format!(
            "download directory must be absolute: {:?}",
            base
        )));
    }

    let dir = base.join(suffix);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|err| LauncherError::Config(format!("failed to create {:?}: {}", dir, err)))?;
    Ok(dir)
}

async fn ensure_ds9(prefs: &Preferences) -> Result<()> {
    let metadata = tokio::fs::metadata(&prefs.ds9.path).await.map_err(|err| {
        LauncherError::Launch(format!(
            "DS9 not found or inaccessible at `{}`: {}",
            prefs.ds9.path, err
        ))
    })?;

    if !metadata.is_file() {
        return Err(LauncherError::Launch(format!(
            "DS9 path `{}` is not a file",
            prefs.ds9.path
        )));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(LauncherError::Launch(format!(
                "DS9 path `{}` is not executable",
                prefs.ds9.path
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn duplicate_frame_ids_collapse_in_request_order() {
        let ids = vec![
            "7".to_string(),
            "3".to_string(),
            "7".to_string(),
            "3".to_string(),
        ];
        assert_eq!(unique_frame_ids(&ids), vec!["7", "3"]);
    }

    #[tokio::test]
    async fn resolves_the_managed_download_dir_under_tmp() {
        let prefs = Preferences::default();
        let suffix = Uuid::new_v4().to_string();
        let dir = ensure_download_dir(&prefs, &suffix).await.expect("dir");
        assert!(dir.ends_with(&suffix));
        assert!(dir.exists());
        std::fs::remove_dir_all(dir).expect("remove test dir");
    }

    #[tokio::test]
    async fn rejects_relative_custom_download_dir() {
        let mut prefs = Preferences::default();
        prefs.custom_download_dir.enabled = true;
        prefs.custom_download_dir.path = "relative/path".to_string();
        let err = ensure_download_dir(&prefs, "x").await.expect_err("relative dir");
        assert_eq!(err.kind(), "Config");
    }

    #[tokio::test]
    async fn rejects_empty_custom_download_dir() {
        let mut prefs = Preferences::default();
        prefs.custom_download_dir.enabled = true;
        let err = ensure_download_dir(&prefs, "x").await.expect_err("empty dir");
        assert_eq!(err.kind(), "Config");
    }

    #[tokio::test]
    async fn rejects_a_missing_ds9_executable() {
        let mut prefs = Preferences::default();
        prefs.ds9.path = "/nonexistent/ds9".to_string();
        let err = ensure_ds9(&prefs).await.expect_err("missing executable");
        assert_eq!(err.kind(), "Launch");
    }
}
