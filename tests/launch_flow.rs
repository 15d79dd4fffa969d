use std::time::Duration;

use tokio::sync::broadcast;

use ds9_launcher::models::{CleanupStatus, FrameStatus, TaskState, TaskStatus};
use ds9_launcher::preferences::{Preferences, PreferencesStore};
use ds9_launcher::services::CoreConfig;
use ds9_launcher::store::StoreEvent;
use ds9_launcher::LauncherCore;

fn test_config() -> CoreConfig {
    CoreConfig {
        download_limit: 10,
        metadata_rate_limit: 50,
        metadata_rate_interval: Duration::from_millis(50),
        // keep finished tasks around so assertions can inspect them
        retain_done_for: Duration::from_secs(300),
    }
}

fn test_preferences(args: &str, mosaic_args: &str) -> Preferences {
    let mut prefs = Preferences::default();
    prefs.ds9.path = "/bin/sh".to_string();
    prefs.ds9.args = args.to_string();
    prefs.ds9.mosaic_args = mosaic_args.to_string();
    prefs
}

fn core_with(prefs: Preferences, config: CoreConfig) -> LauncherCore {
    LauncherCore::with_config(PreferencesStore::in_memory(prefs), config)
}

/// Mounts the metadata endpoint, the one-byte range probe and the full
/// download for one frame.
async fn mock_frame(
    server: &mut mockito::Server,
    frame_id: &str,
    instrument_id: &str,
    reduction_level: u32,
    body: &'static [u8],
) {
    let filename = format!("frame-{}.fits", frame_id);
    let file_path = format!("/files/{}", filename);
    let metadata = serde_json::json!({
        "filename": filename,
        "url": format!("{}{}", server.url(), file_path),
        "instrument_id": instrument_id,
        "reduction_level": reduction_level,
    });

    server
        .mock("GET", format!("/frames/{}/", frame_id).as_str())
        .match_header("authorization", "Token abc")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(metadata.to_string())
        .create_async()
        .await;

    server
        .mock("GET", file_path.as_str())
        .match_header("range", "bytes=0-0")
        .with_status(206)
        .with_header("content-range", format!("bytes 0-0/{}", body.len()).as_str())
        .with_body(&body[..1])
        .create_async()
        .await;

    server
        .mock("GET", file_path.as_str())
        .match_header("range", mockito::Matcher::Missing)
        .with_status(200)
        .with_body(body)
        .create_async()
        .await;
}

fn launch_url(server: &mockito::Server, frame_ids: &str) -> String {
    format!(
        "ds9://launch?frame_ids={}&frame_url={}/frames/&token=abc",
        frame_ids,
        server.url()
    )
}

async fn wait_for_terminal(
    core: &LauncherCore,
    events: &mut broadcast::Receiver<StoreEvent>,
    task_id: &str,
) -> TaskState {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match events.recv().await {
                Ok(StoreEvent::TaskChanged { id, task })
                    if id == task_id && task.status.is_terminal() =>
                {
                    return task;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if let Some(task) = core.snapshot().get(task_id) {
                        if task.status.is_terminal() {
                            return task.clone();
                        }
                    }
                }
                Err(err) => panic!("store event stream closed: {}", err),
            }
        }
    })
    .await
    .expect("task did not reach a terminal status in time")
}

async fn wait_for_status(
    events: &mut broadcast::Receiver<StoreEvent>,
    task_id: &str,
    status: TaskStatus,
) {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if let Ok(StoreEvent::TaskChanged { id, task }) = events.recv().await {
                if id == task_id && task.status == status {
                    return;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("task never reached {:?}", status));
}

#[tokio::test]
async fn wide_field_raw_frames_complete_with_the_mosaic_template() {
    let mut server = mockito::Server::new_async().await;
    mock_frame(&mut server, "1", "fa01", 0, b"FITS-ONE").await;
    mock_frame(&mut server, "2", "fa15", 0, b"FITS-TWO").await;

    let core = core_with(
        test_preferences("-c true std-args", "-c true mosaic-args"),
        test_config(),
    );
    let mut events = core.subscribe_store();
    let task_id = core
        .submit_url(&launch_url(&server, "1,2"))
        .expect("submit should succeed");

    let task = wait_for_terminal(&core, &mut events, &task_id).await;

    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.cleanup, CleanupStatus::Done);
    assert!(task.error.is_none());
    assert!(
        task.stdout[0].contains("mosaic-args"),
        "expected mosaic template in `{}`",
        task.stdout[0]
    );
    assert!(!task.display_url.contains("abc"), "{}", task.display_url);

    for frame in task.frames.values() {
        assert_eq!(frame.status, FrameStatus::Deleted);
        assert_eq!(frame.total_bytes, Some(8));
        assert_eq!(frame.downloaded_bytes, 8);
    }
    let dir = task.download_dir.expect("download dir was resolved");
    assert!(!dir.exists(), "cleanup should remove {:?}", dir);
}

#[tokio::test]
async fn a_repeated_frame_id_is_downloaded_and_passed_to_the_viewer_once() {
    let mut server = mockito::Server::new_async().await;
    let metadata = serde_json::json!({
        "filename": "frame-7.fits",
        "url": format!("{}/files/frame-7.fits", server.url()),
        "instrument_id": "fa01",
        "reduction_level": 0,
    });
    server
        .mock("GET", "/frames/7/")
        .match_header("authorization", "Token abc")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(metadata.to_string())
        .create_async()
        .await;
    server
        .mock("GET", "/files/frame-7.fits")
        .match_header("range", "bytes=0-0")
        .with_status(206)
        .with_header("content-range", "bytes 0-0/8")
        .with_body(b"F")
        .create_async()
        .await;
    let download = server
        .mock("GET", "/files/frame-7.fits")
        .match_header("range", mockito::Matcher::Missing)
        .with_status(200)
        .with_body(b"FITS-ONE")
        .expect(1)
        .create_async()
        .await;

    let core = core_with(
        test_preferences("-c true std-args", "-c true mosaic-args"),
        test_config(),
    );
    let mut events = core.subscribe_store();
    let task_id = core
        .submit_url(&launch_url(&server, "7,7"))
        .expect("submit should succeed");

    let task = wait_for_terminal(&core, &mut events, &task_id).await;

    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.frames.len(), 1);
    assert_eq!(
        task.stdout[0].matches("frame-7.fits").count(),
        1,
        "viewer command repeats the frame: `{}`",
        task.stdout[0]
    );
    download.assert_async().await;
}

#[tokio::test]
async fn a_reduced_frame_selects_the_standard_template() {
    let mut server = mockito::Server::new_async().await;
    mock_frame(&mut server, "1", "fa01", 0, b"FITS-ONE").await;
    mock_frame(&mut server, "2", "fa15", 1, b"FITS-TWO").await;

    let core = core_with(
        test_preferences("-c true std-args", "-c true mosaic-args"),
        test_config(),
    );
    let mut events = core.subscribe_store();
    let task_id = core
        .submit_url(&launch_url(&server, "1,2"))
        .expect("submit should succeed");

    let task = wait_for_terminal(&core, &mut events, &task_id).await;

    assert_eq!(task.status, TaskStatus::Done);
    assert!(
        task.stdout[0].contains("std-args"),
        "expected standard template in `{}`",
        task.stdout[0]
    );
}

#[tokio::test]
async fn a_metadata_failure_fails_the_batch_and_still_cleans_up() {
    let mut server = mockito::Server::new_async().await;
    mock_frame(&mut server, "1", "fa01", 0, b"FITS-ONE").await;
    server
        .mock("GET", "/frames/2/")
        .with_status(500)
        .create_async()
        .await;

    let core = core_with(
        test_preferences("-c true std-args", "-c true mosaic-args"),
        test_config(),
    );
    let mut events = core.subscribe_store();
    let task_id = core
        .submit_url(&launch_url(&server, "1,2"))
        .expect("submit should succeed");

    let task = wait_for_terminal(&core, &mut events, &task_id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    let error = task.error.expect("task error is recorded");
    assert_eq!(error.name, "Fetch");
    for frame in task.frames.values() {
        assert!(
            matches!(
                frame.status,
                FrameStatus::Initializing | FrameStatus::Pending | FrameStatus::Deleted
            ),
            "frame {} advanced past pending: {:?}",
            frame.id,
            frame.status
        );
    }
    assert_eq!(task.cleanup, CleanupStatus::Done);
}

#[tokio::test]
async fn aborting_during_launch_ends_in_aborted_not_failed() {
    let mut server = mockito::Server::new_async().await;
    mock_frame(&mut server, "1", "fa01", 0, b"FITS-ONE").await;

    let core = core_with(
        test_preferences("-c 'sleep 30'", "-c 'sleep 30'"),
        test_config(),
    );
    let mut events = core.subscribe_store();
    let mut terminal_events = core.subscribe_store();
    let task_id = core
        .submit_url(&launch_url(&server, "1"))
        .expect("submit should succeed");

    wait_for_status(&mut events, &task_id, TaskStatus::Launched).await;
    core.abort_task(&task_id).expect("abort should succeed");
    // a second abort is a no-op, not an error
    core.abort_task(&task_id).expect("second abort is idempotent");

    let task = wait_for_terminal(&core, &mut terminal_events, &task_id).await;
    assert_eq!(task.status, TaskStatus::Aborted);
    assert_eq!(task.cleanup, CleanupStatus::Done);

    core.delete_task(&task_id).await.expect("delete settles and removes");
    assert!(core.snapshot().get(&task_id).is_none());
}

#[tokio::test]
async fn downloads_never_exceed_the_concurrency_cap() {
    let mut server = mockito::Server::new_async().await;
    mock_frame(&mut server, "1", "fa01", 0, b"FITS-ONE").await;
    mock_frame(&mut server, "2", "fa02", 0, b"FITS-TWO").await;
    mock_frame(&mut server, "3", "fa03", 0, b"FITS-SIX").await;

    let mut config = test_config();
    config.download_limit = 1;
    let core = core_with(
        test_preferences("-c true std-args", "-c true mosaic-args"),
        config,
    );
    let mut events = core.subscribe_store();
    let task_id = core
        .submit_url(&launch_url(&server, "1,2,3"))
        .expect("submit should succeed");

    // The permit is held from before the request until the frame is marked
    // Downloaded, so with one permit no snapshot may show two frames
    // downloading at once.
    let mut max_downloading = 0usize;
    let final_task = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match events.recv().await {
                Ok(StoreEvent::TaskChanged { id, task }) if id == task_id => {
                    let downloading = task
                        .frames
                        .values()
                        .filter(|frame| frame.status == FrameStatus::Downloading)
                        .count();
                    max_downloading = max_downloading.max(downloading);
                    if task.status.is_terminal() {
                        return task;
                    }
                }
                Ok(_) => {}
                Err(err) => panic!("store event stream closed: {}", err),
            }
        }
    })
    .await
    .expect("task did not finish in time");

    assert_eq!(final_task.status, TaskStatus::Done);
    assert!(
        max_downloading <= 1,
        "observed {} simultaneous downloads with a cap of 1",
        max_downloading
    );
}

#[tokio::test]
async fn a_validation_failure_sends_a_redacted_notification_and_no_task() {
    let core = core_with(
        test_preferences("-c true std-args", "-c true mosaic-args"),
        test_config(),
    );
    let mut toasts = core.subscribe_notifications();

    let result = core.submit_url("ds9://launch?frame_ids=,,&frame_url=http://a.test/&token=s3cr3t");
    assert!(result.is_err());
    assert!(core.snapshot().is_empty(), "no task may be created");

    let toast = toasts.try_recv().expect("validation toast");
    assert_eq!(toast.title, "Invalid");
    assert!(toast.text.contains("at least 1 frame id"), "{}", toast.text);
    assert!(!toast.text.contains("s3cr3t"), "{}", toast.text);
}

#[tokio::test]
async fn unknown_task_ids_are_reported_as_not_found() {
    let core = core_with(
        test_preferences("-c true std-args", "-c true mosaic-args"),
        test_config(),
    );
    assert_eq!(core.abort_task("nope").expect_err("unknown id").kind(), "NotFound");
    assert_eq!(
        core.delete_task("nope").await.expect_err("unknown id").kind(),
        "NotFound"
    );
}
