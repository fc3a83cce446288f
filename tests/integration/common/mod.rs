//! Common test utilities and fixtures for integration tests
//!
//! - Test application built on mock stage executors
//! - Request builders and body parsing
//! - Per-stage mock handles for programming failures

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{Method, Request},
    Router,
};
use serde_json::Value;

use docmaker_common::Config;
use docmaker_jobs::JobManager;
use docmaker_stages::mock::MockStageExecutor;
use docmaker_stages::{StageExecutors, StageKind};

/// Test application: router, manager and the mocks behind it
pub struct TestApp {
    router: Router,
    pub manager: JobManager,
    pub mocks: HashMap<StageKind, Arc<MockStageExecutor>>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let mut executors = StageExecutors::new();
        let mut mocks = HashMap::new();
        for kind in StageKind::ALL {
            let executor = Arc::new(MockStageExecutor::new(kind));
            executor.behavior().set_delay_ms(config.mock_step_delay_ms);
            executors.register(executor.clone());
            mocks.insert(kind, executor);
        }

        let (router, manager) = docmaker_app::create_app_with_executors(&config, executors);
        Self {
            router,
            manager,
            mocks,
        }
    }

    pub fn test_router(&self) -> Router {
        self.router.clone()
    }

    pub fn mock(&self, kind: StageKind) -> &Arc<MockStageExecutor> {
        &self.mocks[&kind]
    }
}

/// Fast configuration: millisecond steps and backoff
pub fn test_config() -> Config {
    Config {
        worker_count: 2,
        queue_capacity: 16,
        mock_step_delay_ms: 1,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        ..Default::default()
    }
}

/// Build a request with an optional JSON body
pub fn request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);

    if let Some(b) = body {
        builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&b).unwrap()))
            .unwrap()
    } else {
        builder.body(Body::empty()).unwrap()
    }
}

/// Parse response body as JSON Value
pub async fn parse_body(response: axum::http::Response<Body>) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

/// Read the whole response body as text
pub async fn body_text(response: axum::http::Response<Body>) -> String {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}
