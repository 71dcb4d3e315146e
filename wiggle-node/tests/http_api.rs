//! HTTP control surface scenarios against a live engine on virtual
//! backends.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use futures::StreamExt;
use http_body_util::BodyExt;
use tower::ServiceExt;
use wiggle_cam::VirtualCameraBackend;
use wiggle_config::{AppConfig, VirtualCameraConfig, VirtualIoConfig};
use wiggle_io::VirtualIoBackend;
use wiggle_node::Node;
use wiggle_types::EngineState;

const TEST_FPS: u32 = 20;

struct TestRig {
    node: Node,
    _media: tempfile::TempDir,
}

fn build_rig() -> TestRig {
    let media = tempfile::tempdir().unwrap();

    let mut config = AppConfig::default();
    config.acquisition.primary = true;
    config.acquisition.standalone_mode = false;
    config.media.data_dir = media.path().to_path_buf();
    config.backend_virtual_io = VirtualIoConfig {
        fps_nominal: TEST_FPS,
        enable_clock: true,
    };
    config.backend_virtual_camera = VirtualCameraConfig {
        width: 64,
        height: 48,
        min_fps: 2,
        max_fps: 120,
        ..Default::default()
    };

    let io = Arc::new(VirtualIoBackend::new(config.backend_virtual_io.clone()));
    let camera = Arc::new(VirtualCameraBackend::new(
        config.backend_virtual_camera.clone(),
    ));
    let node = Node::new(config, io, camera).unwrap();
    node.start().unwrap();

    let end = Instant::now() + Duration::from_secs(5);
    while node.engine.state() != EngineState::Running && Instant::now() < end {
        std::thread::sleep(Duration::from_millis(25));
    }
    assert_eq!(node.engine.state(), EngineState::Running);

    TestRig {
        node,
        _media: media,
    }
}

async fn get(node: &Node, uri: &str) -> axum::response::Response {
    node.router()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn post_json(node: &Node, uri: &str, body: &str) -> axum::response::Response {
    node.router()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn system_endpoints_report_status() {
    let rig = build_rig();
    let response = get(&rig.node, "/api/system/is_healthy").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, serde_json::json!(true));

    let response = get(&rig.node, "/api/system/is_primary").await;
    assert_eq!(json_body(response).await, serde_json::json!(true));

    rig.node.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overlapping_job_setup_is_rejected() {
    let rig = build_rig();

    let first = post_json(&rig.node, "/api/job/setup", r#"{"number_captures":2}"#).await;
    assert_eq!(first.status(), StatusCode::OK);

    let second = post_json(&rig.node, "/api/job/setup", r#"{"number_captures":1}"#).await;
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

    let reset = get(&rig.node, "/api/job/reset").await;
    assert_eq!(reset.status(), StatusCode::OK);

    let third = post_json(&rig.node, "/api/job/setup", r#"{"number_captures":1}"#).await;
    assert_eq!(third.status(), StatusCode::OK);

    rig.node.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn triggered_job_produces_sequenced_jpegs() {
    let rig = build_rig();

    let response = post_json(&rig.node, "/api/job/setup", r#"{"number_captures":5}"#).await;
    assert_eq!(response.status(), StatusCode::OK);
    let job = json_body(response).await;
    let job_id = job["id"].as_str().unwrap().to_string();

    let response = get(&rig.node, "/api/job/trigger").await;
    assert_eq!(response.status(), StatusCode::OK);

    // poll the results endpoint until all five artifacts are registered
    let end = Instant::now() + Duration::from_secs(10);
    let result = loop {
        let response = get(&rig.node, &format!("/api/job/results/{job_id}")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = json_body(response).await;
        if value["filepaths"].as_array().unwrap().len() == 5 {
            break value;
        }
        assert!(Instant::now() < end, "job did not finish: {value}");
        tokio::time::sleep(Duration::from_millis(100)).await;
    };

    let filepaths: Vec<String> = result["filepaths"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();

    // every artifact is a decodable JPEG and filename timestamps increase
    let mut names = Vec::new();
    for path in &filepaths {
        let bytes = std::fs::read(path).unwrap();
        assert!(image::load_from_memory(&bytes).is_ok(), "bad jpeg: {path}");
        names.push(
            std::path::Path::new(path)
                .file_name()
                .unwrap()
                .to_string_lossy()
                .into_owned(),
        );
    }
    let mut sorted = names.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(names, sorted, "timestamps not strictly increasing: {names:?}");

    // artifacts are downloadable by media id
    let media_id = result["mediaitem_ids"][0].as_str().unwrap();
    let response = get(&rig.node, &format!("/api/media/{media_id}/download")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let disposition = response
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.starts_with("attachment; filename="));
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert!(image::load_from_memory(&bytes).is_ok());

    // unknown ids are 404
    let response = get(
        &rig.node,
        "/api/media/00000000-0000-0000-0000-000000000000/download",
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    rig.node.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn job_results_unknown_id_is_404() {
    let rig = build_rig();
    let response = get(
        &rig.node,
        "/api/job/results/00000000-0000-0000-0000-000000000000",
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    rig.node.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn still_returns_a_jpeg() {
    let rig = build_rig();
    let response = get(&rig.node, "/api/camera/still").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "image/jpeg"
    );
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert!(image::load_from_memory(&bytes).is_ok());
    rig.node.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stream_yields_framed_jpegs_and_engine_survives() {
    let rig = build_rig();

    let response = get(&rig.node, "/api/camera/stream.mjpg").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "multipart/x-mixed-replace; boundary=frame"
    );

    const HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
    const TRAILER: &[u8] = b"\r\n\r\n";

    let mut stream = response.into_body().into_data_stream();
    let mut frames = 0;
    let end = Instant::now() + Duration::from_secs(10);
    while frames < 5 {
        assert!(Instant::now() < end, "only {frames} frames arrived");
        let chunk = match tokio::time::timeout(Duration::from_secs(2), stream.next()).await {
            Ok(Some(Ok(chunk))) => chunk,
            other => panic!("stream ended early: {other:?}"),
        };
        // each chunk carries exactly one framed JPEG
        assert!(chunk.starts_with(HEADER), "bad frame header");
        assert!(chunk.ends_with(TRAILER), "bad frame trailer");
        let jpeg = &chunk[HEADER.len()..chunk.len() - TRAILER.len()];
        assert!(image::load_from_memory(jpeg).is_ok(), "bad jpeg in stream");
        frames += 1;
    }
    drop(stream);

    // closing the consumer must leave the engine healthy
    tokio::time::sleep(Duration::from_millis(300)).await;
    let response = get(&rig.node, "/api/system/is_healthy").await;
    assert_eq!(json_body(response).await, serde_json::json!(true));

    rig.node.stop();
}
