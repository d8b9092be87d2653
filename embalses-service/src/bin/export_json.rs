use anyhow::{bail, Result};
use embalses_client::db;
use embalses_service::{config::AppConfig, export, observability};
use std::{env, path::PathBuf};

/// Write the read API as static JSON files for hosting without the server.
///
/// usage: export_json [out_dir]
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() > 2 {
        bail!("usage: export_json [out_dir]");
    }

    let cfg = AppConfig::load()?;
    let out_dir = args.get(1).map(PathBuf::from).unwrap_or(cfg.export.out_dir);

    let pool = db::connect(&cfg.database.path, cfg.database.max_connections).await?;
    db::init_schema(&pool).await?;

    let outcome = export::export_json(&pool, &out_dir).await;
    pool.close().await;

    let summary = outcome?;
    tracing::info!(
        reservoirs = summary.reservoirs,
        files = summary.files,
        out_dir = %out_dir.display(),
        "export finished"
    );
    Ok(())
}
