//! End-to-end sync cycles over real HTTP against an in-process server.

mod common;

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{manifest_json, Route, TestServer};
use gamesync::{EventSink, SyncConfig, SyncEngine, SyncError, SyncEvent};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

const FILES: [(&str, &[u8]); 3] = [
    ("city.img", b"city archive payload"),
    ("models/car.dff", b"car model bytes"),
    ("audio/radio.wav", b"radio"),
];

fn serve_files(server: &TestServer, version: &str) {
    server.route(
        "/manifest.json",
        Route::Body(manifest_json(Some(version), &FILES)),
    );
    for (path, data) in FILES {
        server.route(&format!("/files/{}", path), Route::Body(data.to_vec()));
    }
}

fn config(server: &TestServer, root: &Path) -> SyncConfig {
    SyncConfig::new(
        root,
        server.url("/manifest.json"),
        server.url("/files/"),
    )
    .with_staging_dir(root.join("staging"))
    .with_retry(2, Duration::from_millis(10))
    .with_progress_timing(Duration::from_millis(10), Duration::from_millis(50))
}

fn drain(rx: &mut UnboundedReceiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn terminal(events: &[SyncEvent]) -> Vec<&SyncEvent> {
    events.iter().filter(|e| e.is_terminal()).collect()
}

#[tokio::test]
async fn test_full_sync_then_idempotent_resync() {
    let server = TestServer::start().await;
    serve_files(&server, "1.0.0");
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("game");

    let engine = SyncEngine::new(config(&server, &root)).unwrap();
    let (events, mut rx) = EventSink::channel();
    let outcome = engine.sync(&CancellationToken::new(), &events).await.unwrap();

    assert_eq!(outcome.version, "1.0.0");
    assert_eq!(outcome.downloaded.files, 3);
    for (path, data) in FILES {
        assert_eq!(std::fs::read(root.join(path)).unwrap(), data);
        assert_eq!(server.hits(&format!("/files/{}", path)), 1);
    }
    assert_eq!(engine.installed_version(), "1.0.0");

    let first = drain(&mut rx);
    assert_eq!(terminal(&first), vec![&SyncEvent::Complete]);
    let percents: Vec<u8> = first
        .iter()
        .filter_map(|e| match e {
            SyncEvent::Progress(p) => Some(p.percent),
            _ => None,
        })
        .collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(percents.last(), Some(&100));

    let again = engine.sync(&CancellationToken::new(), &events).await.unwrap();
    assert_eq!(again.downloaded.files, 0);
    for (path, _) in FILES {
        assert_eq!(server.hits(&format!("/files/{}", path)), 1);
    }
    let second = drain(&mut rx);
    assert!(second.contains(&SyncEvent::UpToDate));
    assert_eq!(terminal(&second), vec![&SyncEvent::Complete]);
}

#[tokio::test]
async fn test_check_for_update_reports_without_downloading() {
    let server = TestServer::start().await;
    serve_files(&server, "2.0.0");
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("game");
    std::fs::create_dir_all(root.join("models")).unwrap();
    std::fs::write(root.join("models/car.dff"), b"car model bytes").unwrap();

    let engine = SyncEngine::new(config(&server, &root)).unwrap();
    let (events, mut rx) = EventSink::channel();
    let check = engine
        .check_for_update(&CancellationToken::new(), &events)
        .await
        .unwrap();

    assert!(check.needs_update());
    assert_eq!(check.work_set.len(), 2);
    assert_eq!(check.remote_version.as_deref(), Some("2.0.0"));
    assert_eq!(check.local_version, "0.0.0");
    assert!(check.version_newer);
    assert_eq!(server.hits("/files/city.img"), 0);

    let seen = drain(&mut rx);
    assert!(seen.contains(&SyncEvent::UpdateAvailable {
        files: 2,
        total_bytes: (FILES[0].1.len() + FILES[2].1.len()) as u64,
    }));
}

#[tokio::test]
async fn test_redirect_is_followed() {
    let server = TestServer::start().await;
    server.route(
        "/manifest.json",
        Route::Body(manifest_json(Some("1.0.0"), &[("a.bin", b"moved content".as_slice())])),
    );
    server.route("/files/a.bin", Route::Redirect("/cdn/a.bin".to_string()));
    server.route("/cdn/a.bin", Route::Body(b"moved content".to_vec()));
    let temp = TempDir::new().unwrap();

    let engine = SyncEngine::new(config(&server, temp.path())).unwrap();
    engine.sync(&CancellationToken::new(), &EventSink::none()).await.unwrap();

    assert_eq!(std::fs::read(temp.path().join("a.bin")).unwrap(), b"moved content");
    assert_eq!(server.hits("/cdn/a.bin"), 1);
}

#[tokio::test]
async fn test_redirect_loop_gives_up() {
    let server = TestServer::start().await;
    server.route(
        "/manifest.json",
        Route::Body(manifest_json(None, &[("loop.bin", b"never".as_slice())])),
    );
    server.route("/files/loop.bin", Route::Redirect("/files/loop.bin".to_string()));
    let temp = TempDir::new().unwrap();

    let engine = SyncEngine::new(config(&server, temp.path()).with_max_redirects(3)).unwrap();
    let err = engine
        .sync(&CancellationToken::new(), &EventSink::none())
        .await
        .unwrap_err();

    match err {
        SyncError::PartialFailure { failed } => assert_eq!(failed, vec!["loop.bin".to_string()]),
        other => panic!("unexpected error: {}", other),
    }
    // Two attempts, each following three redirects after the first request.
    assert_eq!(server.hits("/files/loop.bin"), 8);
    assert!(!temp.path().join("loop.bin").exists());
    assert!(!engine.is_installed());
}

#[tokio::test]
async fn test_missing_file_fails_only_that_file() {
    let server = TestServer::start().await;
    server.route(
        "/manifest.json",
        Route::Body(manifest_json(
            Some("1.0.0"),
            &[("present.bin", b"here".as_slice()), ("gone.bin", b"not served".as_slice())],
        )),
    );
    server.route("/files/present.bin", Route::Body(b"here".to_vec()));
    let temp = TempDir::new().unwrap();

    let engine = SyncEngine::new(config(&server, temp.path())).unwrap();
    let (events, mut rx) = EventSink::channel();
    let err = engine.sync(&CancellationToken::new(), &events).await.unwrap_err();

    assert!(matches!(err, SyncError::PartialFailure { ref failed } if failed == &["gone.bin"]));
    assert_eq!(server.hits("/files/gone.bin"), 2);
    assert_eq!(std::fs::read(temp.path().join("present.bin")).unwrap(), b"here");
    assert!(!temp.path().join("gone.bin").exists());

    let seen = drain(&mut rx);
    match terminal(&seen).as_slice() {
        [SyncEvent::Error { message }] => assert!(message.contains("gone.bin")),
        other => panic!("unexpected terminal events: {:?}", other),
    }
}

#[tokio::test]
async fn test_stalled_transfer_is_abandoned() {
    let server = TestServer::start().await;
    let body = vec![7u8; 64];
    server.route(
        "/manifest.json",
        Route::Body(manifest_json(None, &[("slow.bin", body.as_slice())])),
    );
    server.route("/files/slow.bin", Route::Stall { body, send: 16 });
    let temp = TempDir::new().unwrap();

    let config = config(&server, temp.path()).with_idle_timeout(Duration::from_millis(200));
    let engine = SyncEngine::new(config).unwrap();

    let started = std::time::Instant::now();
    let err = engine
        .sync(&CancellationToken::new(), &EventSink::none())
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::PartialFailure { .. }));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(server.hits("/files/slow.bin"), 2);
    assert!(!temp.path().join("slow.bin").exists());
    assert!(!temp.path().join("slow.bin.download").exists());
}

#[tokio::test]
async fn test_partial_temp_is_resumed_with_range() {
    let server = TestServer::start().await;
    let data: &[u8] = b"hello resumable world";
    server.route(
        "/manifest.json",
        Route::Body(manifest_json(Some("1.0.0"), &[("big.bin", data)])),
    );
    server.route("/files/big.bin", Route::Body(data.to_vec()));
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("big.bin.download"), &data[..6]).unwrap();

    let engine = SyncEngine::new(config(&server, temp.path())).unwrap();
    engine.sync(&CancellationToken::new(), &EventSink::none()).await.unwrap();

    assert_eq!(std::fs::read(temp.path().join("big.bin")).unwrap(), data);
    let requests = server.requests("/files/big.bin");
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].range_start, Some(6));
}

#[tokio::test]
async fn test_manifest_errors_are_reported() {
    let server = TestServer::start().await;
    server.route("/manifest.json", Route::Status(500));
    server.route("/bad.json", Route::Body(b"{not json".to_vec()));
    let temp = TempDir::new().unwrap();

    let engine = SyncEngine::new(config(&server, temp.path())).unwrap();
    let (events, mut rx) = EventSink::channel();
    let err = engine.sync(&CancellationToken::new(), &events).await.unwrap_err();
    assert!(matches!(err, SyncError::ManifestUnavailable { .. }));
    assert!(matches!(terminal(&drain(&mut rx)).as_slice(), [SyncEvent::Error { .. }]));

    let mut bad = config(&server, temp.path());
    bad.manifest_url = server.url("/bad.json");
    let engine = SyncEngine::new(bad).unwrap();
    let err = engine
        .check_for_update(&CancellationToken::new(), &EventSink::none())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ManifestUnavailable { .. }));
    assert!(!engine.is_installed());
}

fn game_zip() -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = || zip::write::FileOptions::<()>::default();
    writer.add_directory("Game Root/", options()).unwrap();
    for (path, data) in FILES {
        writer
            .start_file(format!("Game Root/{}", path), options())
            .unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

#[tokio::test]
async fn test_bulk_install_from_zip() {
    let server = TestServer::start().await;
    serve_files(&server, "3.1.0");
    server.route("/full.zip", Route::Body(game_zip()));
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("game");

    let config = config(&server, &root)
        .with_archive_url(server.url("/full.zip"))
        .with_nested_roots(["Game Root"])
        .with_required_files(["city.img"]);
    let engine = SyncEngine::new(config).unwrap();
    let (events, mut rx) = EventSink::channel();
    let outcome = engine
        .install_from_archive(&CancellationToken::new(), &events)
        .await
        .unwrap();

    assert_eq!(outcome.version, "3.1.0");
    assert_eq!(outcome.downloaded.files, 0);
    for (path, data) in FILES {
        assert_eq!(std::fs::read(root.join(path)).unwrap(), data);
        assert_eq!(server.hits(&format!("/files/{}", path)), 0);
    }
    assert!(!root.join("Game Root").exists());
    assert!(!root.join("staging/content.zip").exists());
    assert!(engine.is_installed());

    let seen = drain(&mut rx);
    assert_eq!(terminal(&seen), vec![&SyncEvent::Complete]);
}

fn install_config(server: &TestServer, root: &Path) -> SyncConfig {
    config(server, root)
        .with_archive_url(server.url("/full.zip"))
        .with_nested_roots(["Game Root"])
}

#[tokio::test]
async fn test_corrupt_archive_leaves_nothing_installed() {
    let server = TestServer::start().await;
    serve_files(&server, "3.1.0");
    server.route("/full.zip", Route::Body(b"this is not a zip archive".to_vec()));
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("game");

    let engine = SyncEngine::new(install_config(&server, &root)).unwrap();
    let (events, mut rx) = EventSink::channel();
    let err = engine
        .install_from_archive(&CancellationToken::new(), &events)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::ExtractionFailed { .. }), "{}", err);
    assert_eq!(server.hits("/full.zip"), 1);
    assert!(!root.join("staging/content.zip").exists());
    assert!(!engine.installation().marker_path().exists());
    assert!(!engine.is_installed());
    for (path, _) in FILES {
        assert_eq!(server.hits(&format!("/files/{}", path)), 0);
    }
    assert!(matches!(terminal(&drain(&mut rx)).as_slice(), [SyncEvent::Error { .. }]));
}

#[tokio::test]
async fn test_install_without_required_files_is_not_installed() {
    let server = TestServer::start().await;
    serve_files(&server, "3.1.0");
    server.route("/full.zip", Route::Body(game_zip()));
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("game");

    let config = install_config(&server, &root).with_required_files(["city.img", "game.exe"]);
    let engine = SyncEngine::new(config).unwrap();
    let (events, mut rx) = EventSink::channel();
    let err = engine
        .install_from_archive(&CancellationToken::new(), &events)
        .await
        .unwrap_err();

    match err {
        SyncError::NotInstalled { missing } => assert_eq!(missing, vec!["game.exe".to_string()]),
        other => panic!("unexpected error: {}", other),
    }
    assert!(!engine.is_installed());
    match terminal(&drain(&mut rx)).as_slice() {
        [SyncEvent::Error { message }] => assert!(message.contains("game.exe")),
        other => panic!("unexpected terminal events: {:?}", other),
    }
}

#[tokio::test]
async fn test_install_checks_space_before_downloading() {
    let server = TestServer::start().await;
    serve_files(&server, "3.1.0");
    server.route("/full.zip", Route::Body(game_zip()));
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("game");

    let engine = SyncEngine::new(install_config(&server, &root))
        .unwrap()
        .with_space_probe(Arc::new(|_: &Path| -> std::io::Result<u64> { Ok(1) }));
    let err = engine
        .install_from_archive(&CancellationToken::new(), &EventSink::none())
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::InsufficientSpace { free: 1, .. }));
    assert_eq!(server.hits("/full.zip"), 0);
    assert!(!root.join("staging/content.zip").exists());
    assert!(!engine.is_installed());
}
