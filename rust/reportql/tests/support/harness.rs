use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{self, Request, StatusCode},
    Router,
};
use reportql::{
    config::AppConfig,
    error::Result,
    query::CompiledQuery,
    server::Server,
    storage::{Row, Storage},
};
use serde_json::Value;
use std::{
    sync::{Arc, Mutex, Once},
    time::Duration,
};
use tower::ServiceExt;

pub const API_KEY: &str = "test-api-key";

static TRACING_INIT: Once = Once::new();

type Responder = Box<dyn Fn(&CompiledQuery) -> Vec<Value> + Send + Sync>;

/// Answers every statement from a closure and remembers what it was asked.
pub struct RecordingStorage {
    respond: Responder,
    seen: Mutex<Vec<CompiledQuery>>,
}

#[async_trait]
impl Storage for RecordingStorage {
    async fn fetch(&self, query: &CompiledQuery) -> Result<Vec<Row>> {
        self.seen.lock().unwrap().push(query.clone());
        Ok((self.respond)(query)
            .into_iter()
            .map(|row| row.as_object().cloned().expect("fixture rows must be objects"))
            .collect())
    }
}

pub struct TestHarness {
    router: Router,
    storage: Arc<RecordingStorage>,
}

impl TestHarness {
    pub fn new(respond: impl Fn(&CompiledQuery) -> Vec<Value> + Send + Sync + 'static) -> Self {
        TRACING_INIT.call_once(|| {
            let _ = tracing_subscriber::fmt::try_init();
        });

        let storage = Arc::new(RecordingStorage {
            respond: Box::new(respond),
            seen: Mutex::new(Vec::new()),
        });
        let server = Server::with_storage(test_config(), storage.clone());
        Self {
            router: server.router(),
            storage,
        }
    }

    pub fn seen(&self) -> Vec<CompiledQuery> {
        self.storage.seen.lock().unwrap().clone()
    }

    pub async fn post(&self, path: &str, payload: &Value) -> http::Response<Body> {
        self.request(path, payload, true).await
    }

    #[allow(dead_code)]
    pub async fn post_without_api_key(&self, path: &str, payload: &Value) -> http::Response<Body> {
        self.request(path, payload, false).await
    }

    #[allow(dead_code)]
    pub async fn get(&self, path: &str) -> http::Response<Body> {
        let request = Request::builder()
            .uri(path)
            .body(Body::empty())
            .expect("failed to build harness request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond")
    }

    async fn request(&self, path: &str, payload: &Value, include_api_key: bool) -> http::Response<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header(http::header::CONTENT_TYPE, "application/json");
        if include_api_key {
            builder = builder.header("x-api-key", API_KEY);
        }

        let body = serde_json::to_vec(payload).expect("request payload should serialize");
        let request = builder
            .body(Body::from(body))
            .expect("failed to build harness request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond")
    }
}

pub fn test_config() -> AppConfig {
    AppConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        database_url: "postgres://unused/reportql".to_string(),
        max_pool_size: 1,
        pg_ssl_root_cert: None,
        pg_ssl_cert: None,
        pg_ssl_key: None,
        api_key: Some(API_KEY.to_string()),
        default_page_size: 50,
        max_page_size: 1000,
        default_across_count: 90,
        query_timeout: Duration::from_secs(5),
        stack_concurrency: 2,
        max_stack_depth: 1,
        hierarchy_max_depth: 64,
        hierarchy_max_nodes: 1000,
    }
}

pub async fn read_json(response: http::Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("response body should be readable");
    let value =
        serde_json::from_slice::<Value>(&bytes).expect("response body should be valid JSON");
    (status, value)
}
