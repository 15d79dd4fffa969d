use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::future::try_join_all;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::{LauncherError, Result};
use crate::models::{FrameStatus, TaskStatus};
use crate::services::run_cancellable;
use crate::store::TaskStore;

/// Streams remote frame files to the task's download directory. The permit
/// pool is shared across all tasks, so concurrent tasks compete for the same
/// global transfer allowance.
#[derive(Clone)]
pub struct DownloadManager {
    client: reqwest::Client,
    store: TaskStore,
    permits: Arc<Semaphore>,
}

impl DownloadManager {
    pub fn new(client: reqwest::Client, store: TaskStore, permits: Arc<Semaphore>) -> Self {
        Self {
            client,
            store,
            permits,
        }
    }

    /// Downloads every frame of the task concurrently, bounded by the global
    /// permit pool. The first failure cancels the sibling transfers of this
    /// task and propagates.
    pub async fn download_all(
        &self,
        dir: &Path,
        task_id: &str,
        frame_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.store.update(task_id, |task| {
            task.status = TaskStatus::Downloading;
        });

        let batch = cancel.child_token();
        try_join_all(frame_ids.iter().map(|frame_id| {
            let batch = batch.clone();
            async move {
                let result = self.download_frame(dir, task_id, frame_id, &batch).await;
                if result.is_err() {
                    batch.cancel();
                }
                result
            }
        }))
        .await?;
        Ok(())
    }

    async fn download_frame(
        &self,
        dir: &Path,
        task_id: &str,
        frame_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(LauncherError::Cancelled),
            permit = self.permits.clone().acquire_owned() => permit
                .map_err(|_| LauncherError::Config("download limiter closed".to_string()))?,
        };

        let frame = self
            .store
            .get(task_id)
            .and_then(|task| task.frames.get(frame_id).cloned())
            .ok_or_else(|| download_error(format!("no metadata for frame {}", frame_id)))?;
        let filename = frame
            .filename
            .ok_or_else(|| download_error(format!("frame {} has no filename", frame_id)))?;
        let download_url = frame
            .download_url
            .ok_or_else(|| download_error(format!("frame {} has no download URL", frame_id)))?;

        let filepath: PathBuf = dir.join(&filename);
        debug!("downloading frame {} to {:?}", frame_id, filepath);

        let response = run_cancellable(cancel, async {
            Ok(self.client.get(&download_url).send().await?)
        })
        .await
        .map_err(|err| wrap_download(format!("request to {} failed", download_url), err))?;

        if !response.status().is_success() {
            return Err(download_error(format!(
                "{} returned HTTP {}",
                download_url,
                response.status()
            )));
        }

        self.store.update_frame(task_id, frame_id, |frame| {
            frame.filepath = Some(filepath.clone());
        });

        let mut file = tokio::fs::File::create(&filepath)
            .await
            .map_err(|err| wrap_download(format!("cannot create {:?}", filepath), err.into()))?;
        let mut stream = response.bytes_stream();
        let mut first_chunk = true;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(LauncherError::Cancelled),
                next = stream.next() => next,
            };
            let Some(next) = next else { break };
            let bytes = next
                .map_err(|err| wrap_download(format!("stream from {} failed", download_url), err.into()))?;
            file.write_all(&bytes)
                .await
                .map_err(|err| wrap_download(format!("write to {:?} failed", filepath), err.into()))?;

            let count = bytes.len() as u64;
            self.store.update_frame(task_id, frame_id, move |frame| {
                if first_chunk {
                    frame.status = FrameStatus::Downloading;
                }
                frame.add_downloaded_bytes(count);
            });
            first_chunk = false;
        }

        file.flush()
            .await
            .map_err(|err| wrap_download(format!("flush of {:?} failed", filepath), err.into()))?;

        self.store.update_frame(task_id, frame_id, |frame| {
            frame.status = FrameStatus::Downloaded;
        });

        Ok(())
    }
}

fn download_error(message: String) -> LauncherError {
    LauncherError::Download {
        message,
        source: None,
    }
}

/// Every transfer failure surfaces as the same Download error class carrying
/// its cause; cancellation keeps its own kind so aborts route to Aborted.
fn wrap_download(message: String, err: LauncherError) -> LauncherError {
    if err.is_cancelled() {
        return LauncherError::Cancelled;
    }
    LauncherError::download(message, err)
}
