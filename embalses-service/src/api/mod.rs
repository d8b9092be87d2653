//! Read-only JSON API over the reservoir store.
//!
//! - `GET /health`
//! - `GET /api/meta`
//! - `GET /api/resumen`
//! - `GET /api/cuencas`
//! - `GET /api/embalses?cuenca=&min_porc=&page=&per_page=`
//! - `GET /api/embalses/:nombre?desde=&hasta=&cuenca=`

pub mod error;
pub mod params;

use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    routing::get,
    Json, Router,
};
use embalses_client::{
    db::reservoir_queries::{self, Page},
    domain::{NationalSummary, ReservoirDetail, ReservoirSnapshot, RunMeta},
};
use sqlx::SqlitePool;
use tower_http::cors::{Any, CorsLayer};

pub use error::ApiError;
use params::{DetailParams, ListParams};

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
    pub default_per_page: u32,
    pub max_per_page: u32,
}

impl ApiState {
    pub fn new(pool: SqlitePool, default_per_page: u32, max_per_page: u32) -> Self {
        Self {
            pool,
            default_per_page,
            max_per_page,
        }
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/meta", get(meta))
        .route("/api/resumen", get(resumen))
        .route("/api/cuencas", get(cuencas))
        .route("/api/embalses", get(list_embalses))
        .route("/api/embalses/:nombre", get(embalse_detail))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(state: ApiState, bind_addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "query API listening");
    axum::serve(listener, router(state).into_make_service()).await?;
    Ok(())
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn meta(State(state): State<ApiState>) -> Result<Json<RunMeta>, ApiError> {
    metrics::counter!("api_requests_total", "route" => "meta").increment(1);
    Ok(Json(reservoir_queries::run_meta(&state.pool).await?))
}

async fn resumen(State(state): State<ApiState>) -> Result<Json<NationalSummary>, ApiError> {
    metrics::counter!("api_requests_total", "route" => "resumen").increment(1);
    Ok(Json(reservoir_queries::national_summary(&state.pool).await?))
}

async fn cuencas(State(state): State<ApiState>) -> Result<Json<Vec<String>>, ApiError> {
    metrics::counter!("api_requests_total", "route" => "cuencas").increment(1);
    Ok(Json(reservoir_queries::basins(&state.pool).await?))
}

async fn list_embalses(
    State(state): State<ApiState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Page<ReservoirSnapshot>>, ApiError> {
    metrics::counter!("api_requests_total", "route" => "embalses").increment(1);

    let filter = params.filter()?;
    let pagination = params.pagination(state.default_per_page, state.max_per_page)?;
    let page = reservoir_queries::list_reservoirs(&state.pool, &filter, pagination).await?;

    tracing::debug!(total = page.total, page = page.page, per_page = page.per_page, "reservoir page served");
    Ok(Json(page))
}

async fn embalse_detail(
    State(state): State<ApiState>,
    Path(nombre): Path<String>,
    Query(params): Query<DetailParams>,
) -> Result<Json<ReservoirDetail>, ApiError> {
    metrics::counter!("api_requests_total", "route" => "embalse").increment(1);

    let range = params.range()?;
    let detail = reservoir_queries::reservoir_detail(&state.pool, &nombre, params.basin(), range).await?;
    Ok(Json(detail))
}
