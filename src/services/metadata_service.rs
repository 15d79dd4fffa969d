use std::sync::Arc;
use std::time::Duration;

use futures_util::future::try_join_all;
use reqwest::header::{AUTHORIZATION, CONTENT_RANGE, RANGE};
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::{LauncherError, Result};
use crate::models::{FrameState, FrameStatus};
use crate::parse_url::LaunchRequest;
use crate::services::run_cancellable;
use crate::store::TaskStore;

#[derive(Deserialize)]
struct FrameMetadata {
    filename: String,
    url: String,
    instrument_id: String,
    reduction_level: u32,
}

/// Fixed-window outbound rate limiter: at most `limit` request starts per
/// `interval`, to avoid hammering the archive API.
#[derive(Clone)]
pub struct RateLimiter {
    limit: u32,
    interval: Duration,
    window: Arc<tokio::sync::Mutex<Window>>,
}

struct Window {
    started: Instant,
    admitted: u32,
}

impl RateLimiter {
    pub fn new(limit: u32, interval: Duration) -> Self {
        Self {
            limit: limit.max(1),
            interval,
            window: Arc::new(tokio::sync::Mutex::new(Window {
                started: Instant::now(),
                admitted: 0,
            })),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut window = self.window.lock().await;
                let now = Instant::now();
                if now.duration_since(window.started) >= self.interval {
                    window.started = now;
                    window.admitted = 0;
                }
                if window.admitted < self.limit {
                    window.admitted += 1;
                    return;
                }
                self.interval
                    .saturating_sub(now.duration_since(window.started))
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Retrieves per-frame descriptors from the archive API and records them in
/// the store. Any single failure aborts the whole batch.
#[derive(Clone)]
pub struct MetadataService {
    client: reqwest::Client,
    store: TaskStore,
    limiter: RateLimiter,
}

impl MetadataService {
    pub fn new(client: reqwest::Client, store: TaskStore, limiter: RateLimiter) -> Self {
        Self {
            client,
            store,
            limiter,
        }
    }

    /// Fetches metadata for every frame id concurrently, bounded by the rate
    /// limiter. The first failure cancels the sibling fetches; their
    /// half-updated frames stay Initializing/Pending and are discarded at
    /// cleanup.
    pub async fn fetch_all(
        &self,
        request: &LaunchRequest,
        frame_ids: &[String],
        task_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let batch = cancel.child_token();
        try_join_all(frame_ids.iter().map(|frame_id| {
            let batch = batch.clone();
            async move {
                let result = self.fetch_frame(request, task_id, frame_id, &batch).await;
                if result.is_err() {
                    batch.cancel();
                }
                result
            }
        }))
        .await?;
        Ok(())
    }

    async fn fetch_frame(
        &self,
        request: &LaunchRequest,
        task_id: &str,
        frame_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.limiter.acquire().await;
        if cancel.is_cancelled() {
            return Err(LauncherError::Cancelled);
        }

        self.store.update_frame(task_id, frame_id, |frame| {
            *frame = FrameState::new(frame_id);
        });

        let metadata_url = request
            .frame_url
            .join(&format!("{}/", frame_id))
            .map_err(|err| LauncherError::Fetch(format!("bad metadata URL for frame {}: {}", frame_id, err)))?;

        debug!("fetching metadata for frame {} from {}", frame_id, metadata_url);

        let response = run_cancellable(cancel, async {
            Ok(self
                .client
                .get(metadata_url.clone())
                .header(AUTHORIZATION, format!("Token {}", request.token))
                .send()
                .await?)
        })
        .await?;

        if !response.status().is_success() {
            return Err(LauncherError::Fetch(format!(
                "metadata request to {} returned HTTP {}",
                metadata_url,
                response.status()
            )));
        }

        let metadata: FrameMetadata =
            run_cancellable(cancel, async { Ok(response.json().await?) }).await?;

        // The archive's pre-signed storage URLs reject HEAD, so learn the
        // size from a one-byte Range request instead.
        let total_bytes = self.probe_size(&metadata.url, cancel).await?;

        self.store.update_frame(task_id, frame_id, |frame| {
            frame.status = FrameStatus::Pending;
            frame.filename = Some(metadata.filename.clone());
            frame.download_url = Some(metadata.url.clone());
            frame.total_bytes = Some(total_bytes);
            frame.downloaded_bytes = 0;
            frame.instrument_id = Some(metadata.instrument_id.clone());
            frame.reduction_level = Some(metadata.reduction_level);
        });

        Ok(())
    }

    async fn probe_size(&self, download_url: &str, cancel: &CancellationToken) -> Result<u64> {
        let response = run_cancellable(cancel, async {
            Ok(self
                .client
                .get(download_url)
                .header(RANGE, "bytes=0-0")
                .send()
                .await?)
        })
        .await?;

        if !response.status().is_success() {
            return Err(LauncherError::Fetch(format!(
                "range probe of {} returned HTTP {}",
                download_url,
                response.status()
            )));
        }

        let header = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                LauncherError::Fetch(format!("range probe of {} returned no Content-Range", download_url))
            })?;

        parse_content_range_total(header).ok_or_else(|| {
            LauncherError::Fetch(format!(
                "unparseable Content-Range `{}` from {}",
                header, download_url
            ))
        })
    }
}

/// Pulls the total size out of a `Content-Range: bytes 0-0/12345` header.
fn parse_content_range_total(header: &str) -> Option<u64> {
    header.rsplit('/').next()?.trim().parse().ok()
}
