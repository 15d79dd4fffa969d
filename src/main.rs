use std::path::PathBuf;
use std::process::ExitCode;

use tracing::{error, info, warn};

use ds9_launcher::models::{Severity, TaskStatus};
use ds9_launcher::preferences::PreferencesStore;
use ds9_launcher::store::StoreEvent;
use ds9_launcher::{logging, LauncherCore};

fn preferences_path() -> PathBuf {
    if let Ok(value) = std::env::var("DS9_LAUNCHER_CONFIG") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    PathBuf::from("preferences.json")
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = logging::init(&logging::resolve_log_dir()) {
        eprintln!("failed to initialize logging: {}", err);
    }

    let Some(url) = std::env::args().nth(1) else {
        eprintln!("usage: ds9-launcher <ds9://... url>");
        return ExitCode::from(2);
    };

    let core = LauncherCore::new(PreferencesStore::load(preferences_path()));
    let mut store_events = core.subscribe_store();
    let mut toasts = core.subscribe_notifications();

    let task_id = match core.submit_url(&url) {
        Ok(id) => id,
        Err(err) => {
            error!("{}", err);
            eprintln!("{}", err);
            return ExitCode::from(2);
        }
    };

    let mut last_status = None;
    let final_status = loop {
        tokio::select! {
            event = store_events.recv() => {
                match event {
                    Ok(StoreEvent::TaskChanged { id, task }) if id == task_id => {
                        if last_status != Some(task.status) {
                            info!("task {} -> {:?}", id, task.status);
                            last_status = Some(task.status);
                        }
                        if task.status.is_terminal() {
                            break task.status;
                        }
                    }
                    Ok(StoreEvent::TaskRemoved { id }) if id == task_id => {
                        break last_status.unwrap_or(TaskStatus::Failed);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!("store event stream closed: {}", err);
                        break last_status.unwrap_or(TaskStatus::Failed);
                    }
                }
            }
            toast = toasts.recv() => {
                if let Ok(toast) = toast {
                    match toast.severity {
                        Severity::Danger => eprintln!("{}: {}", toast.title, toast.text),
                        _ => println!("{}: {}", toast.title, toast.text),
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupt received, aborting task {}", task_id);
                let _ = core.abort_task(&task_id);
            }
        }
    };

    match final_status {
        TaskStatus::Done | TaskStatus::Aborted => ExitCode::SUCCESS,
        _ => {
            if let Some(task) = core.snapshot().get(&task_id) {
                if let Some(task_error) = &task.error {
                    eprintln!("{}: {}", task_error.name, task_error.message);
                }
            }
            ExitCode::FAILURE
        }
    }
}
