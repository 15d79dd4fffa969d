use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::errors::{LauncherError, Result};

pub mod download_manager;
pub mod launch_service;
pub mod metadata_service;
pub mod notification_hub;
pub mod task_manager;

pub use download_manager::DownloadManager;
pub use launch_service::LaunchService;
pub use metadata_service::MetadataService;
pub use notification_hub::NotificationHub;
pub use task_manager::{CoreConfig, TaskManager};

/// Runs a fallible future under a cancellation token. Components attach this
/// at every suspension point so an abort unwinds with a distinct error kind.
pub(crate) async fn run_cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(LauncherError::Cancelled),
        result = fut => result,
    }
}
