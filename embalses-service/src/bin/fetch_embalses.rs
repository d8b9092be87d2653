use anyhow::{bail, Result};
use embalses_client::{db, domain::RawRecord};
use embalses_service::{
    config::AppConfig,
    metrics_server, observability,
    pipeline::{EnvelopeStream, Pipeline, Source},
    sinks::SqliteLoader,
    sources::{AccessTools, ArchiveFileSource, HttpBulletinSource},
    transform,
};
use std::{env, sync::Arc};

/// Either the published archive or a local copy of it.
enum BulletinSource {
    Http(HttpBulletinSource),
    Archive(ArchiveFileSource),
}

#[async_trait::async_trait]
impl Source<RawRecord> for BulletinSource {
    async fn stream(&self) -> EnvelopeStream<RawRecord> {
        match self {
            Self::Http(s) => s.stream().await,
            Self::Archive(s) => s.stream().await,
        }
    }
}

/// One ingestion run: fetch the bulletin, validate, load it in a single
/// transaction. Exits non-zero when the run fails so cron can report it.
///
/// usage: fetch_embalses [local_archive.zip]
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() > 2 {
        bail!("usage: fetch_embalses [archive_path]");
    }

    let cfg = AppConfig::load()?;

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let pool = db::connect(&cfg.database.path, cfg.database.max_connections).await?;
    db::init_schema(&pool).await?;

    let source = match args.get(1) {
        Some(path) => {
            tracing::info!(path = %path, "loading local bulletin archive");
            BulletinSource::Archive(
                ArchiveFileSource::new(path, cfg.fetch.channel_capacity)
                    .with_access_tools(AccessTools::from(&cfg.fetch)),
            )
        }
        None => BulletinSource::Http(HttpBulletinSource::new(&cfg.fetch)?),
    };

    let pipeline: Pipeline<_, RawRecord, _> = Pipeline {
        source,
        transforms: vec![
            Arc::new(transform::PercentageDerivation),
            Arc::new(transform::RecordValidation),
        ],
        sink: SqliteLoader::new(pool.clone()),
    };

    let outcome = pipeline.run().await;
    pool.close().await;

    match outcome {
        Ok(result) => {
            tracing::info!(
                inserted = result.inserted,
                updated = result.updated,
                unchanged = result.unchanged,
                rejected = result.rejected,
                "bulletin ingestion finished"
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "bulletin ingestion failed, previous data left intact");
            Err(e.into())
        }
    }
}
