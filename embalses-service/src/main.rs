use anyhow::Result;
use embalses_client::db;
use embalses_service::{
    api::{self, ApiState},
    config::AppConfig,
    metrics_server, observability,
};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let pool = db::connect(&cfg.database.path, cfg.database.max_connections).await?;
    db::init_schema(&pool).await?;
    tracing::info!(path = %cfg.database.path, "reservoir store opened");

    let state = ApiState::new(pool, cfg.api.default_per_page, cfg.api.max_per_page);
    api::serve(state, &cfg.api.bind_addr).await
}
