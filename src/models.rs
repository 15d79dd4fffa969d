use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::LauncherError;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Initializing,
    Downloading,
    Launching,
    Launched,
    Closed,
    Aborting,
    Aborted,
    Failed,
    Done,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Aborted | TaskStatus::Failed)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Initializing,
    Pending,
    Downloading,
    Downloaded,
    Deleted,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleanupStatus {
    Pending,
    Skip,
    Attempting,
    Done,
    Skipped,
    Failed,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FrameState {
    pub id: String,
    pub status: FrameStatus,
    pub filename: Option<String>,
    pub filepath: Option<PathBuf>,
    pub download_url: Option<String>,
    pub total_bytes: Option<u64>,
    pub downloaded_bytes: u64,
    pub instrument_id: Option<String>,
    pub reduction_level: Option<u32>,
}

impl FrameState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: FrameStatus::Initializing,
            filename: None,
            filepath: None,
            download_url: None,
            total_bytes: None,
            downloaded_bytes: 0,
            instrument_id: None,
            reduction_level: None,
        }
    }

    /// Progress counter, clamped so it never runs past a known total.
    pub fn add_downloaded_bytes(&mut self, count: u64) {
        let next = self.downloaded_bytes.saturating_add(count);
        self.downloaded_bytes = match self.total_bytes {
            Some(total) => next.min(total),
            None => next,
        };
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    pub name: String,
    pub message: String,
    pub trace: Option<String>,
}

impl TaskError {
    pub fn from_error(err: &LauncherError) -> Self {
        Self {
            name: err.kind().to_string(),
            message: err.to_string(),
            trace: Some(format!("{:?}", err)),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TaskState {
    pub id: String,
    pub url: String,
    pub display_url: String,
    pub created_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub frame_ids: Vec<String>,
    pub frames: HashMap<String, FrameState>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub cleanup: CleanupStatus,
    pub download_dir: Option<PathBuf>,
    pub error: Option<TaskError>,
}

impl TaskState {
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        display_url: impl Into<String>,
        frame_ids: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            display_url: display_url.into(),
            created_at: Utc::now(),
            status: TaskStatus::Initializing,
            frame_ids,
            frames: HashMap::new(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            cleanup: CleanupStatus::Pending,
            download_dir: None,
            error: None,
        }
    }

    /// Frames in the order the request listed them, each id at most once.
    /// Frames whose metadata never arrived are skipped.
    pub fn ordered_frames(&self) -> Vec<FrameState> {
        let mut seen: Vec<&String> = Vec::with_capacity(self.frame_ids.len());
        let mut frames = Vec::with_capacity(self.frame_ids.len());
        for id in &self.frame_ids {
            if seen.contains(&id) {
                continue;
            }
            seen.push(id);
            if let Some(frame) = self.frames.get(id) {
                frames.push(frame.clone());
            }
        }
        frames
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Danger,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub severity: Severity,
    pub title: String,
    pub text: String,
}

impl Notification {
    pub fn danger(title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            severity: Severity::Danger,
            title: title.into(),
            text: text.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_frames_yields_each_id_once_in_request_order() {
        let mut task = TaskState::new(
            "t",
            "ds9://x",
            "ds9://x",
            vec!["2".to_string(), "1".to_string(), "2".to_string()],
        );
        task.frames.insert("1".to_string(), FrameState::new("1"));
        task.frames.insert("2".to_string(), FrameState::new("2"));

        let ordered: Vec<String> = task
            .ordered_frames()
            .into_iter()
            .map(|frame| frame.id)
            .collect();
        assert_eq!(ordered, vec!["2", "1"]);
    }

    #[test]
    fn ordered_frames_skips_ids_without_metadata() {
        let mut task = TaskState::new(
            "t",
            "ds9://x",
            "ds9://x",
            vec!["1".to_string(), "2".to_string()],
        );
        task.frames.insert("2".to_string(), FrameState::new("2"));

        let ordered: Vec<String> = task
            .ordered_frames()
            .into_iter()
            .map(|frame| frame.id)
            .collect();
        assert_eq!(ordered, vec!["2"]);
    }

    #[test]
    fn downloaded_bytes_clamp_to_a_known_total() {
        let mut frame = FrameState::new("1");
        frame.total_bytes = Some(10);
        frame.add_downloaded_bytes(8);
        frame.add_downloaded_bytes(8);
        assert_eq!(frame.downloaded_bytes, 10);
    }
}
