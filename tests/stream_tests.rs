//! Stream server integration tests
//!
//! Runs the real axum router on an ephemeral port and exercises the range
//! matrix, path containment, ownership enforcement, and live-session
//! streaming with a scripted engine.

mod common;

use common::*;
use mediaswarm::{
    api, DownloadEvent, DownloadRecord, DownloadStatus, DownloadManager, RecordStore, StartRequest,
};
use reqwest::header;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const MAGNET_A: &str = "magnet:?xt=urn:btih:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

async fn serve_app(manager: Arc<DownloadManager>) -> String {
    let app = api::router(manager);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{}", addr)
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

fn as_user(
    req: reqwest::RequestBuilder,
    user: &str,
    role: &str,
) -> reqwest::RequestBuilder {
    req.header("X-User-Id", user).header("X-User-Role", role)
}

/// Insert a record directly, simulating prior lifecycle activity
async fn insert_record(
    store: &Arc<mediaswarm::MemoryStore>,
    status: DownloadStatus,
    save_path: Option<PathBuf>,
) -> DownloadRecord {
    let mut record = DownloadRecord::new(&StartRequest {
        reference: format!("magnet:?xt=urn:btih:{}", uuid::Uuid::new_v4().simple()),
        display_name: "Example.Movie.1080p".to_string(),
        owner_id: "user-1".to_string(),
        media_id: None,
        origin: None,
        quality: None,
        language: None,
    });
    record.status = status;
    record.save_path = save_path;
    store.insert(&record).await.unwrap();
    record
}

// =============================================================================
// Range matrix against an on-disk file
// =============================================================================

async fn disk_fixture() -> (TempDir, Arc<DownloadManager>, String, DownloadRecord) {
    let temp = TempDir::new().unwrap();
    let content: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    tokio::fs::write(temp.path().join("movie.mp4"), &content)
        .await
        .unwrap();

    let (manager, _engine, _sessions, store) = test_manager(&temp);
    let record = insert_record(
        &store,
        DownloadStatus::Completed,
        Some(PathBuf::from("movie.mp4")),
    )
    .await;
    let base = serve_app(manager.clone()).await;
    (temp, manager, base, record)
}

#[tokio::test]
async fn no_range_serves_200_with_full_length() {
    let (_temp, _manager, base, record) = disk_fixture().await;

    let resp = as_user(
        client().get(format!("{}/downloads/{}/stream", base, record.id)),
        "user-1",
        "user",
    )
    .send()
    .await
    .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get(header::ACCEPT_RANGES).unwrap(),
        "bytes"
    );
    assert_eq!(
        resp.headers().get(header::CONTENT_LENGTH).unwrap(),
        "1000"
    );
    assert_eq!(
        resp.headers().get(header::CONTENT_TYPE).unwrap(),
        "video/mp4"
    );
    assert_eq!(resp.bytes().await.unwrap().len(), 1000);
}

#[tokio::test]
async fn satisfiable_range_serves_206_with_exact_bytes() {
    let (_temp, _manager, base, record) = disk_fixture().await;

    let resp = as_user(
        client().get(format!("{}/downloads/{}/stream", base, record.id)),
        "user-1",
        "user",
    )
    .header(header::RANGE, "bytes=100-199")
    .send()
    .await
    .unwrap();

    assert_eq!(resp.status(), 206);
    assert_eq!(
        resp.headers().get(header::CONTENT_RANGE).unwrap(),
        "bytes 100-199/1000"
    );
    assert_eq!(resp.headers().get(header::CONTENT_LENGTH).unwrap(), "100");
    let body = resp.bytes().await.unwrap();
    assert_eq!(body.len(), 100);
    assert_eq!(body[0], (100u32 % 251) as u8);
}

#[tokio::test]
async fn unsatisfiable_ranges_serve_416_with_size() {
    let (_temp, _manager, base, record) = disk_fixture().await;
    let url = format!("{}/downloads/{}/stream", base, record.id);

    for range in [
        "bytes=1000-",
        "bytes=0-1000",
        "bytes=500-400",
        // Start wider than u64 is past the end of any file
        "bytes=99999999999999999999-",
    ] {
        let resp = as_user(client().get(&url), "user-1", "user")
            .header(header::RANGE, range)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 416, "range {} must be rejected", range);
        assert_eq!(
            resp.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes */1000",
            "range {}",
            range
        );
    }
}

#[tokio::test]
async fn open_ended_and_suffix_ranges_work() {
    let (_temp, _manager, base, record) = disk_fixture().await;
    let url = format!("{}/downloads/{}/stream", base, record.id);

    let resp = as_user(client().get(&url), "user-1", "user")
        .header(header::RANGE, "bytes=900-")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(
        resp.headers().get(header::CONTENT_RANGE).unwrap(),
        "bytes 900-999/1000"
    );

    let resp = as_user(client().get(&url), "user-1", "user")
        .header(header::RANGE, "bytes=-50")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(
        resp.headers().get(header::CONTENT_RANGE).unwrap(),
        "bytes 950-999/1000"
    );
}

#[tokio::test]
async fn head_carries_headers_without_body() {
    let (_temp, _manager, base, record) = disk_fixture().await;

    let resp = as_user(
        client().head(format!("{}/downloads/{}/stream", base, record.id)),
        "user-1",
        "user",
    )
    .send()
    .await
    .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get(header::CONTENT_LENGTH).unwrap(), "1000");
    assert!(resp.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_ends_active_stream_bodies() {
    let (_temp, manager, _base, record) = disk_fixture().await;

    // Hold an open response body, then delete the download under it
    let resp = mediaswarm::stream::serve(
        &manager,
        record.id,
        &axum::http::HeaderMap::new(),
        false,
    )
    .await
    .unwrap();
    assert_eq!(resp.status(), 200);

    manager.delete(record.id).await.unwrap();

    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(
        body.is_empty(),
        "body must end once the download is deleted, got {} bytes",
        body.len()
    );
}

// =============================================================================
// Containment and not-found
// =============================================================================

#[tokio::test]
async fn traversal_save_path_is_rejected() {
    let temp = TempDir::new().unwrap();
    let (manager, _engine, _sessions, store) = test_manager(&temp);
    let record = insert_record(
        &store,
        DownloadStatus::Completed,
        Some(PathBuf::from("../outside/movie.mp4")),
    )
    .await;
    let base = serve_app(manager).await;

    let resp = as_user(
        client().get(format!("{}/downloads/{}/stream", base, record.id)),
        "user-1",
        "user",
    )
    .send()
    .await
    .unwrap();

    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn failed_record_without_file_is_404_not_500() {
    let temp = TempDir::new().unwrap();
    let (manager, _engine, _sessions, store) = test_manager(&temp);
    let record = insert_record(&store, DownloadStatus::Failed, None).await;
    let base = serve_app(manager).await;

    let resp = as_user(
        client().get(format!("{}/downloads/{}/stream", base, record.id)),
        "user-1",
        "user",
    )
    .send()
    .await
    .unwrap();

    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn unknown_id_is_404() {
    let temp = TempDir::new().unwrap();
    let (manager, _engine, _sessions, _store) = test_manager(&temp);
    let base = serve_app(manager).await;

    let resp = as_user(
        client().get(format!(
            "{}/downloads/{}/stream",
            base,
            mediaswarm::DownloadId::new()
        )),
        "user-1",
        "user",
    )
    .send()
    .await
    .unwrap();
    assert_eq!(resp.status(), 404);
}

// =============================================================================
// Ownership at the boundary
// =============================================================================

#[tokio::test]
async fn other_users_are_forbidden_admins_bypass() {
    let (_temp, _manager, base, record) = disk_fixture().await;
    let url = format!("{}/downloads/{}", base, record.id);

    let resp = as_user(client().get(&url), "user-2", "user")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let resp = as_user(client().get(&url), "user-2", "admin")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client().get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 401, "identity header is required");
}

#[tokio::test]
async fn list_is_scoped_to_caller_unless_privileged() {
    let temp = TempDir::new().unwrap();
    let (manager, _engine, _sessions, store) = test_manager(&temp);
    insert_record(&store, DownloadStatus::Queued, None).await;
    let mut other = DownloadRecord::new(&StartRequest {
        reference: "magnet:?xt=urn:btih:other".to_string(),
        display_name: "Other".to_string(),
        owner_id: "user-2".to_string(),
        media_id: None,
        origin: None,
        quality: None,
        language: None,
    });
    other.status = DownloadStatus::Queued;
    store.insert(&other).await.unwrap();
    let base = serve_app(manager).await;

    let mine: Vec<serde_json::Value> = as_user(
        client().get(format!("{}/downloads", base)),
        "user-1",
        "user",
    )
    .send()
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
    assert_eq!(mine.len(), 1);

    let all: Vec<serde_json::Value> = as_user(
        client().get(format!("{}/downloads?all=true", base)),
        "user-1",
        "admin",
    )
    .send()
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
    assert_eq!(all.len(), 2);
}

// =============================================================================
// Live-session streaming
// =============================================================================

#[tokio::test]
async fn live_session_serves_ranges_through_the_engine() {
    let temp = TempDir::new().unwrap();
    let (manager, _engine, mut sessions, _store) = test_manager(&temp);
    let mut events = manager.subscribe();

    let record = manager
        .start(magnet_request(MAGNET_A, "Example"))
        .await
        .unwrap();
    let session = next_session(&mut sessions).await;

    let content: Vec<u8> = (0..500u32).map(|i| (i % 256) as u8).collect();
    session.set_video_file("movie.mp4", content, 500);
    session.emit_ready(ready_info("aaa", "Example", 500)).await;
    wait_for_event(
        &mut events,
        |e| matches!(e, DownloadEvent::StateChanged { id, .. } if *id == record.id),
        Duration::from_secs(2),
    )
    .await
    .unwrap();

    let base = serve_app(manager).await;
    let resp = as_user(
        client().get(format!("{}/downloads/{}/stream", base, record.id)),
        "user-1",
        "user",
    )
    .header(header::RANGE, "bytes=10-19")
    .send()
    .await
    .unwrap();

    assert_eq!(resp.status(), 206);
    assert_eq!(
        resp.headers().get(header::CONTENT_RANGE).unwrap(),
        "bytes 10-19/500"
    );
    let body = resp.bytes().await.unwrap();
    assert_eq!(body.as_ref(), &(10..20u32).map(|i| i as u8).collect::<Vec<_>>()[..]);
}

#[tokio::test]
async fn files_endpoint_lists_session_files() {
    let temp = TempDir::new().unwrap();
    let (manager, _engine, mut sessions, _store) = test_manager(&temp);
    let mut events = manager.subscribe();

    let record = manager
        .start(magnet_request(MAGNET_A, "Example"))
        .await
        .unwrap();
    let session = next_session(&mut sessions).await;
    session.set_video_file("movie.mkv", vec![0u8; 64], 32);
    session.emit_ready(ready_info("aaa", "Example", 64)).await;
    wait_for_event(
        &mut events,
        |e| matches!(e, DownloadEvent::StateChanged { id, .. } if *id == record.id),
        Duration::from_secs(2),
    )
    .await
    .unwrap();

    let base = serve_app(manager).await;
    let files: Vec<serde_json::Value> = as_user(
        client().get(format!("{}/downloads/{}/files", base, record.id)),
        "user-1",
        "user",
    )
    .send()
    .await
    .unwrap()
    .json()
    .await
    .unwrap();

    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["path"], "movie.mkv");
    assert_eq!(files[0]["length"], 64);
    assert_eq!(files[0]["bytes_done"], 32);
}
