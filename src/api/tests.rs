use super::{ApiServeDeps, build_app, cors};
use crate::{
    engine::{
        AddDownload, EngineHandle, FilePriority, MirrorControl, MirrorEngine, MirrorOptions,
        SnapshotRx, StorageMode, start_worker,
    },
    fs::{StreamOptions, VirtualDirectory},
    pieces::PriorityScheduler,
    session::{ShutdownReason, ShutdownTrigger},
};
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{HeaderValue, Method, Request, StatusCode, header},
};
use serde_json::Value;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tower::util::ServiceExt as _;

const PIECE: u64 = 16_384;

fn pattern(len: usize, salt: u8) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ salt).collect()
}

struct Harness {
    tmp: tempfile::TempDir,
    seed: PathBuf,
    engine: EngineHandle,
    snapshots: SnapshotRx,
    control: MirrorControl,
    scheduler: Arc<PriorityScheduler>,
    trigger: ShutdownTrigger,
    join: Option<std::thread::JoinHandle<()>>,
}

impl Harness {
    fn new(hold_metadata: bool) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let seed = tmp.path().join("show");
        std::fs::create_dir_all(&seed).unwrap();
        std::fs::write(seed.join("a.srt"), pattern(100, 0x11)).unwrap();
        std::fs::write(seed.join("b.mkv"), pattern(40_000, 0x22)).unwrap();

        let engine = MirrorEngine::new(MirrorOptions {
            piece_length: PIECE,
            rate: 0,
            hold_metadata,
            ..MirrorOptions::default()
        });
        let control = engine.control();
        let (handle, snapshots, join) =
            start_worker(engine, Duration::from_millis(5)).expect("worker");
        Self {
            tmp,
            seed,
            scheduler: Arc::new(PriorityScheduler::new(handle.clone())),
            engine: handle,
            snapshots,
            control,
            trigger: ShutdownTrigger::new(),
            join: Some(join),
        }
    }

    async fn attach(&self) {
        self.engine
            .add_download(AddDownload {
                uri: self.seed.display().to_string(),
                save_path: self.tmp.path().join("out"),
                storage_mode: StorageMode::Sparse,
            })
            .await
            .unwrap();
    }

    async fn attach_complete(&self) {
        self.attach().await;
        self.control.complete_all().unwrap();
        let mut rx = self.snapshots.clone();
        rx.wait_for(|s| {
            s.as_ref()
                .is_some_and(|s| s.has_metadata() && s.pieces.all())
        })
        .await
        .unwrap();
    }

    fn app(&self) -> Router {
        build_app(ApiServeDeps {
            engine: self.engine.clone(),
            directory: VirtualDirectory::new(
                self.snapshots.clone(),
                StreamOptions {
                    end_window: 100 * 1024,
                    poll_interval: Duration::from_millis(10),
                },
            ),
            scheduler: Arc::clone(&self.scheduler),
            shutdown: self.trigger.clone(),
            status_timeout: Duration::from_secs(2),
            metadata_wait: Duration::from_millis(100),
        })
    }

    async fn finish(mut self) {
        self.engine.shutdown().await.unwrap();
        if let Some(join) = self.join.take() {
            join.join().unwrap();
        }
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, headers, body.to_vec())
}

async fn get(app: &Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    send(app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

fn json(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap()
}

#[tokio::test]
async fn health_is_ok() {
    let h = Harness::new(false);
    let (status, _, body) = get(&h.app(), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body), serde_json::json!({ "ok": true }));
    h.finish().await;
}

#[tokio::test]
async fn status_before_download_is_minus_one_only() {
    let h = Harness::new(false);
    let (status, _, body) = get(&h.app(), "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body), serde_json::json!({ "state": -1 }));
    h.finish().await;
}

#[tokio::test]
async fn status_reports_served_file_progress() {
    let h = Harness::new(false);
    h.attach_complete().await;
    let app = h.app();
    let (status, _, body) = get(&app, "/status").await;
    assert_eq!(status, StatusCode::OK);
    let v = json(&body);
    assert!(v["state"].as_i64().unwrap() >= 0);
    assert_eq!(v["has_metadata"], true);
    assert_eq!(v["num_peers"], 0);
    assert!(v["download_rate"].is_number());
    // Largest file b.mkv spans pieces 0..=3 of the 16 KiB grid.
    assert_eq!(v["served_file"], 1);
    assert_eq!(v["total_pieces"], 3);
    assert_eq!(v["max_piece"], 3);
    h.finish().await;
}

#[tokio::test]
async fn listing_before_metadata_is_service_unavailable() {
    let h = Harness::new(true);
    h.attach().await;
    let app = h.app();

    let (status, headers, body) = get(&app, "/ls").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(headers.get(header::RETRY_AFTER).unwrap(), "1");
    assert_eq!(json(&body)["code"], 503);

    let (status, _, _) = get(&app, "/files/show/b.mkv").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    h.control.release_metadata().unwrap();
    let mut rx = h.snapshots.clone();
    rx.wait_for(|s| s.as_ref().is_some_and(|s| s.has_metadata()))
        .await
        .unwrap();
    let (status, _, body) = get(&app, "/ls").await;
    assert_eq!(status, StatusCode::OK);
    let files = json(&body)["files"].as_array().unwrap().clone();
    assert_eq!(files.len(), 2);
    assert_eq!(files[0]["complete_pieces"], 0);
    h.finish().await;
}

#[tokio::test]
async fn listing_reports_each_entry() {
    let h = Harness::new(false);
    h.attach_complete().await;
    let (status, _, body) = get(&h.app(), "/ls").await;
    assert_eq!(status, StatusCode::OK);
    let v = json(&body);
    let files = v["files"].as_array().unwrap();
    assert_eq!(files[0]["name"], "show/a.srt");
    assert_eq!(files[0]["size"], 100);
    assert_eq!(files[0]["offset"], 0);
    assert_eq!(files[1]["name"], "show/b.mkv");
    assert_eq!(files[1]["offset"], 100);
    assert_eq!(files[1]["total_pieces"], 3);
    assert_eq!(files[1]["complete_pieces"], 3);
    h.finish().await;
}

#[tokio::test]
async fn full_file_read_streams_all_bytes_and_selects_served_file() {
    let h = Harness::new(false);
    h.attach_complete().await;
    let (status, headers, body) = get(&h.app(), "/files/show/b.mkv").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "video/x-matroska");
    assert_eq!(headers.get(header::ACCEPT_RANGES).unwrap(), "bytes");
    assert_eq!(headers.get(header::CONTENT_LENGTH).unwrap(), "40000");
    assert_eq!(body, pattern(40_000, 0x22));

    assert_eq!(h.scheduler.served().await, Some(1));
    assert_eq!(
        h.engine.file_priorities().await.unwrap(),
        vec![FilePriority::Suppressed, FilePriority::Active]
    );
    h.finish().await;
}

#[tokio::test]
async fn range_request_returns_partial_content() {
    let h = Harness::new(false);
    h.attach_complete().await;
    let req = Request::builder()
        .uri("/files/show/b.mkv")
        .header(header::RANGE, "bytes=20000-20099")
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = send(&h.app(), req).await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        headers.get(header::CONTENT_RANGE).unwrap(),
        "bytes 20000-20099/40000"
    );
    assert_eq!(body, pattern(40_000, 0x22)[20_000..20_100].to_vec());
    h.finish().await;
}

#[tokio::test]
async fn unsatisfiable_range_is_416() {
    let h = Harness::new(false);
    h.attach_complete().await;
    let req = Request::builder()
        .uri("/files/show/a.srt")
        .header(header::RANGE, "bytes=500-")
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = send(&h.app(), req).await;
    assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(headers.get(header::CONTENT_RANGE).unwrap(), "bytes */100");
    assert_eq!(json(&body)["code"], 416);
    h.finish().await;
}

#[tokio::test]
async fn unknown_paths_are_404_envelopes() {
    let h = Harness::new(false);
    h.attach_complete().await;
    let app = h.app();

    let (status, _, body) = get(&app, "/files/show/missing.mkv").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json(&body)["code"], 404);

    let (status, _, _) = get(&app, "/files/show/../../etc/passwd").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, body) = get(&app, "/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json(&body)["message"], "not found");
    h.finish().await;
}

#[tokio::test]
async fn root_redirects_to_listing() {
    let h = Harness::new(false);
    let (status, headers, _) = get(&h.app(), "/").await;
    assert!(status.is_redirection());
    assert_eq!(headers.get(header::LOCATION).unwrap(), "/ls");
    h.finish().await;
}

#[tokio::test]
async fn shutdown_acknowledges_and_fires_trigger() {
    let h = Harness::new(false);
    let req = Request::builder()
        .method(Method::POST)
        .uri("/shutdown")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&h.app(), req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");
    assert_eq!(h.trigger.reason(), Some(ShutdownReason::Requested));

    // GET works too and does not re-fire.
    let (status, _, _) = get(&h.app(), "/shutdown").await;
    assert_eq!(status, StatusCode::OK);
    h.finish().await;
}

#[tokio::test]
async fn cors_allows_loopback_and_rejects_foreign_origins() {
    let h = Harness::new(false);
    let app = h.app();

    let preflight = Request::builder()
        .method(Method::OPTIONS)
        .uri("/files/show/b.mkv")
        .header(header::ORIGIN, "http://localhost:8080")
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = send(&app, preflight).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(
        headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
        "http://localhost:8080"
    );
    assert!(
        headers
            .get(header::ACCESS_CONTROL_ALLOW_HEADERS)
            .unwrap()
            .to_str()
            .unwrap()
            .contains("Range")
    );

    let foreign = Request::builder()
        .uri("/health")
        .header(header::ORIGIN, "https://example.com")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&app, foreign).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json(&body)["code"], 403);

    assert!(cors::is_allowed_origin(&HeaderValue::from_static("http://[::1]:3000")));
    assert!(!cors::is_allowed_origin(&HeaderValue::from_static("null")));
    h.finish().await;
}
