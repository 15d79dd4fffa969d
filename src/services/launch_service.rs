use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{LauncherError, Result};
use crate::models::{FrameState, TaskStatus};
use crate::preferences::Preferences;
use crate::store::TaskStore;

/// Spawns the DS9 viewer against a task's downloaded frames and records its
/// output and exit.
#[derive(Clone)]
pub struct LaunchService {
    store: TaskStore,
}

impl LaunchService {
    pub fn new(store: TaskStore) -> Self {
        Self { store }
    }

    /// Resolves the argument template, spawns DS9 and waits for it to exit.
    /// Returns the raw exit code; by default any observed exit ends the phase,
    /// and `failOnNonzeroExit` opts into treating a non-zero code as an error.
    pub async fn launch(
        &self,
        prefs: &Preferences,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<i32>> {
        self.store.update(task_id, |task| {
            task.status = TaskStatus::Launching;
        });

        let frames = self
            .store
            .get(task_id)
            .map(|task| task.ordered_frames())
            .unwrap_or_default();

        let template = if all_mosaic(&frames) {
            &prefs.ds9.mosaic_args
        } else {
            &prefs.ds9.args
        };

        let mut args = shlex::split(template).ok_or_else(|| {
            LauncherError::Launch(format!("malformed argument template `{}`", template))
        })?;
        for frame in &frames {
            let filepath = frame.filepath.clone().ok_or_else(|| {
                LauncherError::Launch(format!("frame {} has no downloaded file", frame.id))
            })?;
            args.push(filepath.to_string_lossy().into_owned());
        }

        let rendered = render_command_line(&prefs.ds9.path, &args);
        let (command, command_args) =
            wrap_for_sandbox(&prefs.ds9.path, args, std::env::var("FLATPAK_ID").ok().as_deref());

        debug!("launching `{}`", rendered);
        self.store.update(task_id, |task| {
            task.stdout.push(format!("$ {}", rendered));
        });

        let mut child = Command::new(&command)
            .args(&command_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                LauncherError::Launch(format!("failed to spawn `{}`: {}", command, err))
            })?;

        self.store.update(task_id, |task| {
            task.status = TaskStatus::Launched;
        });

        let stdout_reader = child.stdout.take().map(|out| {
            self.stream_lines(task_id, out, false)
        });
        let stderr_reader = child.stderr.take().map(|err| {
            self.stream_lines(task_id, err, true)
        });

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(LauncherError::Cancelled);
            }
            status = child.wait() => status.map_err(|err| {
                LauncherError::Launch(format!("failed waiting for `{}`: {}", command, err))
            })?,
        };

        // output pumps finish once the pipes close
        if let Some(reader) = stdout_reader {
            let _ = reader.await;
        }
        if let Some(reader) = stderr_reader {
            let _ = reader.await;
        }

        let code = status.code();
        self.store.update(task_id, |task| {
            task.stdout.push(match code {
                Some(code) => format!("process exited with code {}", code),
                None => "process terminated by signal".to_string(),
            });
        });

        if prefs.ds9.fail_on_nonzero_exit && !status.success() {
            warn!("ds9 exited abnormally for task {}: {:?}", task_id, code);
            return Err(LauncherError::Launch(match code {
                Some(code) => format!("command returned non-zero exit code: {}", code),
                None => "command terminated by signal".to_string(),
            }));
        }

        Ok(code)
    }

    fn stream_lines<R>(
        &self,
        task_id: &str,
        pipe: R,
        is_stderr: bool,
    ) -> tokio::task::JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let store = self.store.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                store.update(&task_id, |task| {
                    if is_stderr {
                        task.stderr.push(line.clone());
                    } else {
                        task.stdout.push(line.clone());
                    }
                });
            }
        })
    }
}

/// Mosaic mode applies only when every frame is a wide-field (`fa*`)
/// instrument at raw reduction level 0.
fn all_mosaic(frames: &[FrameState]) -> bool {
    frames.iter().all(|frame| {
        frame
            .instrument_id
            .as_deref()
            .map(|id| id.contains("fa"))
            .unwrap_or(false)
            && frame.reduction_level == Some(0)
    })
}

fn render_command_line(executable: &str, args: &[String]) -> String {
    let joined = shlex::try_join(args.iter().map(String::as_str))
        .unwrap_or_else(|_| args.join(" "));
    format!("{} {}", executable, joined)
}

/// Inside a Flatpak the viewer must run on the host, where its shared
/// libraries live, so the invocation is re-wrapped through flatpak-spawn.
fn wrap_for_sandbox(
    executable: &str,
    args: Vec<String>,
    flatpak_id: Option<&str>,
) -> (String, Vec<String>) {
    if flatpak_id.is_some() {
        let mut wrapped = vec!["--host".to_string(), executable.to_string()];
        wrapped.extend(args);
        ("flatpak-spawn".to_string(), wrapped)
    } else {
        (executable.to_string(), args)
    }
}
