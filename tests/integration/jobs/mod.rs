//! Jobs API integration tests

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use docmaker_common::Config;
use docmaker_stages::mock::MockOutcome;
use docmaker_stages::{StageErrorKind, StageKind};

use crate::common::{body_text, parse_body, request, test_config, TestApp};

const EPSILON: f64 = 1e-9;

/// Helper: submit a job and return status code plus parsed body
async fn submit(app: &TestApp, body: Value) -> (StatusCode, Value) {
    let resp = app
        .test_router()
        .oneshot(request(Method::POST, "/v1/jobs", Some(body)))
        .await
        .unwrap();
    let status = resp.status();
    (status, parse_body(resp).await)
}

/// Helper: submit a valid job and return its id
async fn submit_ok(app: &TestApp, body: Value) -> Uuid {
    let (status, body) = submit(app, body).await;
    assert_eq!(status, StatusCode::ACCEPTED, "{}", body);
    body["job_id"].as_str().unwrap().parse().unwrap()
}

async fn get(app: &TestApp, uri: &str) -> (StatusCode, Value) {
    let resp = app
        .test_router()
        .oneshot(request(Method::GET, uri, None))
        .await
        .unwrap();
    let status = resp.status();
    (status, parse_body(resp).await)
}

async fn cancel(app: &TestApp, id: Uuid) -> (StatusCode, Value) {
    let resp = app
        .test_router()
        .oneshot(request(
            Method::POST,
            &format!("/v1/jobs/{}/cancel", id),
            None,
        ))
        .await
        .unwrap();
    let status = resp.status();
    (status, parse_body(resp).await)
}

fn documentary() -> Value {
    json!({
        "prompt": "history of AI",
        "duration": 60,
        "style": "cinematic",
        "music": "epic",
        "voice": "narrator"
    })
}

#[tokio::test]
async fn test_health_check() {
    let app = TestApp::new();
    let resp = app
        .test_router()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp).await, "OK");
}

#[tokio::test]
async fn test_submit_then_status_is_immediately_visible() {
    let app = TestApp::new();
    let (status, body) = submit(&app, documentary()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(matches!(
        body["status"].as_str(),
        Some("queued") | Some("running")
    ));

    let id = body["job_id"].as_str().unwrap();
    let (status, snapshot) = get(&app, &format!("/v1/jobs/{}", id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["job_id"], id);
    assert!(matches!(
        snapshot["status"].as_str(),
        Some("queued") | Some("running") | Some("succeeded")
    ));
}

#[tokio::test]
async fn test_job_runs_to_success() {
    let app = TestApp::new();
    let id = submit_ok(&app, documentary()).await;
    app.manager.wait(id).await.unwrap();

    let (status, snapshot) = get(&app, &format!("/v1/jobs/{}", id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["status"], "succeeded");
    assert_eq!(snapshot["overall_progress"], 1.0);
    assert_eq!(snapshot["message"], "Complete!");
    assert!(snapshot["result"]["uri"]
        .as_str()
        .unwrap()
        .starts_with("generated-video-"));
    assert!(snapshot.get("error").is_none());

    let names: Vec<&str> = snapshot["stages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["script", "visual", "audio", "render"]);
    for stage in ["script", "visual", "audio", "render"] {
        assert_eq!(snapshot["per_stage_progress"][stage], 1.0);
    }
    assert_eq!(snapshot["request"]["settings"]["voice"], "narrator");
}

#[tokio::test]
async fn test_music_none_plans_three_stages() {
    let app = TestApp::new();
    let id = submit_ok(
        &app,
        json!({"prompt": "tidal pools", "music": "none", "voice": "young"}),
    )
    .await;

    let (_, snapshot) = get(&app, &format!("/v1/jobs/{}", id)).await;
    let stages = snapshot["stages"].as_array().unwrap();
    assert_eq!(stages.len(), 3);
    let sum: f64 = stages.iter().map(|s| s["weight"].as_f64().unwrap()).sum();
    assert!((sum - 1.0).abs() < EPSILON);
    assert!(snapshot["per_stage_progress"].get("audio").is_none());
}

#[tokio::test]
async fn test_omitted_settings_use_defaults() {
    let app = TestApp::new();
    let id = submit_ok(&app, json!({"prompt": "coral reefs"})).await;
    let (_, snapshot) = get(&app, &format!("/v1/jobs/{}", id)).await;

    let settings = &snapshot["request"]["settings"];
    assert_eq!(settings["duration"], 60);
    assert_eq!(settings["style"], "cinematic");
    assert_eq!(settings["music"], "dramatic");
    assert_eq!(settings["voice"], "professional");
}

#[tokio::test]
async fn test_validation_errors() {
    let app = TestApp::new();
    let cases = [
        json!({"prompt": ""}),
        json!({"prompt": "   "}),
        json!({"prompt": "ok", "duration": 45}),
        json!({"prompt": "ok", "style": "noir"}),
        json!({"prompt": "ok", "music": "jazz"}),
        json!({"prompt": "ok", "voice": "robot"}),
        json!({"duration": 60}),
    ];
    for body in cases {
        let (status, resp) = submit(&app, body.clone()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{} -> {}", body, resp);
        assert_eq!(resp["error"]["code"], "VALIDATION_ERROR");
    }
    // No partial job left behind
    let (_, list) = get(&app, "/v1/jobs").await;
    assert!(list.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_job_is_404() {
    let app = TestApp::new();
    let id = Uuid::new_v4();

    let (status, body) = get(&app, &format!("/v1/jobs/{}", id)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    let (status, _) = cancel(&app, id).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let resp = app
        .test_router()
        .oneshot(request(
            Method::GET,
            &format!("/v1/jobs/{}/events", id),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_running_job() {
    let app = TestApp::new();
    app.mock(StageKind::Visual)
        .behavior()
        .set_outcome(MockOutcome::Hang);
    let id = submit_ok(&app, documentary()).await;

    let mut updates = app.manager.subscribe(id).unwrap();
    updates
        .wait_for(|s| s.current_stage == Some(StageKind::Visual))
        .await
        .unwrap();

    let (status, ack) = cancel(&app, id).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["acknowledged"], true);

    app.manager.wait(id).await.unwrap();
    let (_, snapshot) = get(&app, &format!("/v1/jobs/{}", id)).await;
    assert_eq!(snapshot["status"], "cancelled");
    assert_eq!(snapshot["cancel_reason"], "user");
    assert!(snapshot.get("error").is_none());
    assert!(snapshot.get("result").is_none());

    let (status, ack) = cancel(&app, id).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["acknowledged"], false);
}

#[tokio::test]
async fn test_retry_then_success_reports_attempts() {
    let app = TestApp::new();
    app.mock(StageKind::Script)
        .behavior()
        .set_failures_before_success(1);
    let id = submit_ok(&app, documentary()).await;
    app.manager.wait(id).await.unwrap();

    let (_, snapshot) = get(&app, &format!("/v1/jobs/{}", id)).await;
    assert_eq!(snapshot["status"], "succeeded");
    assert_eq!(snapshot["stages"][0]["name"], "script");
    assert_eq!(snapshot["stages"][0]["attempts"], 2);
    assert_eq!(snapshot["stages"][1]["attempts"], 1);
}

#[tokio::test]
async fn test_exhausted_retries_report_failing_stage() {
    let app = TestApp::new();
    let render = app.mock(StageKind::Render).behavior();
    render.set_outcome(MockOutcome::Fail(StageErrorKind::ResourceExhausted));
    render.set_error_message("GPU memory exhausted");
    let id = submit_ok(&app, documentary()).await;
    app.manager.wait(id).await.unwrap();

    let (_, snapshot) = get(&app, &format!("/v1/jobs/{}", id)).await;
    assert_eq!(snapshot["status"], "failed");
    assert!(snapshot.get("result").is_none());
    assert_eq!(snapshot["error"]["stage"], "render");
    assert_eq!(snapshot["error"]["attempts"], 2);
    assert!(snapshot["error"]["message"]
        .as_str()
        .unwrap()
        .contains("GPU memory exhausted"));
    assert_eq!(snapshot["message"], "Failed during render stage");
}

#[tokio::test]
async fn test_queue_full_returns_429() {
    let app = TestApp::with_config(Config {
        worker_count: 1,
        queue_capacity: 1,
        ..test_config()
    });
    app.mock(StageKind::Script)
        .behavior()
        .set_outcome(MockOutcome::Hang);

    let running = submit_ok(&app, documentary()).await;
    let mut updates = app.manager.subscribe(running).unwrap();
    updates
        .wait_for(|s| s.status == docmaker_jobs::JobStatus::Running)
        .await
        .unwrap();
    submit_ok(&app, documentary()).await;

    let (status, body) = submit(&app, documentary()).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "RATE_LIMIT_EXCEEDED");

    app.manager.shutdown().await;
    let (status, _) = submit(&app, documentary()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_list_jobs_with_filters() {
    let app = TestApp::new();
    app.mock(StageKind::Visual)
        .behavior()
        .set_outcome(MockOutcome::Fail(StageErrorKind::InvalidInput));

    let failed = submit_ok(&app, documentary()).await;
    app.manager.wait(failed).await.unwrap();
    app.mock(StageKind::Visual).behavior().reset();
    app.mock(StageKind::Visual).behavior().set_delay_ms(1);
    let succeeded = submit_ok(&app, documentary()).await;
    app.manager.wait(succeeded).await.unwrap();

    let (status, all) = get(&app, "/v1/jobs").await;
    assert_eq!(status, StatusCode::OK);
    let all = all.as_array().unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0]["job_id"], succeeded.to_string());

    let (_, only_failed) = get(&app, "/v1/jobs?status=failed").await;
    let only_failed = only_failed.as_array().unwrap();
    assert_eq!(only_failed.len(), 1);
    assert_eq!(only_failed[0]["job_id"], failed.to_string());

    let (_, page) = get(&app, "/v1/jobs?limit=1&offset=1").await;
    let page = page.as_array().unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0]["job_id"], failed.to_string());

    let resp = app
        .test_router()
        .oneshot(request(Method::GET, "/v1/jobs?status=paused", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_event_stream_ends_with_terminal_snapshot() {
    let app = TestApp::new();
    let id = submit_ok(&app, documentary()).await;

    let resp = app
        .test_router()
        .oneshot(request(
            Method::GET,
            &format!("/v1/jobs/{}/events", id),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );

    let text = body_text(resp).await;
    assert!(text.contains("event: snapshot"));
    assert!(text.contains(&format!("id: {}:", id)));

    let snapshots: Vec<Value> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).unwrap())
        .collect();
    assert!(!snapshots.is_empty());
    let progress: Vec<f64> = snapshots
        .iter()
        .map(|s| s["overall_progress"].as_f64().unwrap())
        .collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{:?}", progress);
    assert_eq!(snapshots.last().unwrap()["status"], "succeeded");
}

#[tokio::test]
async fn test_event_stream_for_finished_job() {
    let app = TestApp::new();
    let id = submit_ok(&app, documentary()).await;
    app.manager.wait(id).await.unwrap();

    let resp = app
        .test_router()
        .oneshot(request(
            Method::GET,
            &format!("/v1/jobs/{}/events", id),
            None,
        ))
        .await
        .unwrap();
    let text = body_text(resp).await;
    let data: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .collect();
    assert_eq!(data.len(), 1);
    assert!(data[0].contains("\"status\":\"succeeded\""));
}
