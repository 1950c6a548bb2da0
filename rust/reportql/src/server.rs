use crate::{
    config::AppConfig,
    db::{self, PgStorage},
    error::{Result, ServiceError},
    pagination::Page,
    query::{
        AggregateResponse, DoraRequest, DoraResponse, HierarchyResponse, QueryEngine,
        ReportRequest, TranslateRequest, TranslateResponse,
    },
    state::AppState,
    storage::{Row, Storage},
};
use axum::{
    extract::State,
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct Server {
    config: Arc<AppConfig>,
    state: AppState,
}

impl Server {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let pool = db::connect_pool(&config).await?;
        Ok(Self::with_storage(config, Arc::new(PgStorage::new(pool))))
    }

    /// Builds the service around any executor; the HTTP surface is identical.
    pub fn with_storage(config: AppConfig, storage: Arc<dyn Storage>) -> Self {
        let config = Arc::new(config);
        let query = QueryEngine::new(storage, Arc::clone(&config));
        let state = AppState::new(Arc::clone(&config), query);
        Self { config, state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(Self::health))
            .route("/api/aggregate", post(Self::aggregate))
            .route("/api/list", post(Self::list))
            .route("/api/dora", post(Self::dora))
            .route("/api/hierarchy", post(Self::hierarchy))
            .route("/translate", post(Self::translate))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "reportql listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    async fn health() -> Json<serde_json::Value> {
        Json(json!({ "status": "ok" }))
    }

    async fn aggregate(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<ReportRequest>,
    ) -> Result<Json<AggregateResponse>> {
        enforce_api_key(&headers, &state.config)?;
        Ok(Json(state.query.aggregate(request).await?))
    }

    async fn list(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<ReportRequest>,
    ) -> Result<Json<Page<Row>>> {
        enforce_api_key(&headers, &state.config)?;
        Ok(Json(state.query.list(request).await?))
    }

    async fn dora(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<DoraRequest>,
    ) -> Result<Json<DoraResponse>> {
        enforce_api_key(&headers, &state.config)?;
        Ok(Json(state.query.dora(request).await?))
    }

    async fn hierarchy(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<ReportRequest>,
    ) -> Result<Json<HierarchyResponse>> {
        enforce_api_key(&headers, &state.config)?;
        Ok(Json(state.query.hierarchy(request).await?))
    }

    async fn translate(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<TranslateRequest>,
    ) -> Result<Json<TranslateResponse>> {
        enforce_api_key(&headers, &state.config)?;
        Ok(Json(state.query.translate(request)?))
    }
}

fn enforce_api_key(headers: &HeaderMap, config: &AppConfig) -> Result<()> {
    let Some(expected) = &config.api_key else {
        return Ok(());
    };
    let provided = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok());
    if provided == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(ServiceError::Auth)
    }
}
