use std::{collections::HashSet, path::Path};

use anyhow::{Context, Result};
use embalses_client::{
    db::reservoir_queries::{self, DateRange, Pagination, ReservoirFilter, MAX_PER_PAGE},
    domain::ReservoirSnapshot,
    QueryError,
};
use serde::Serialize;
use sqlx::SqlitePool;

/// What a static export wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub reservoirs: usize,
    pub files: usize,
}

#[derive(Serialize)]
struct ReservoirList<'a> {
    data: &'a [ReservoirSnapshot],
}

/// File stem for a reservoir: path separators become `-`.
pub fn file_stem(name: &str) -> String {
    name.replace(['/', '\\'], "-")
}

/// Write the read API as static JSON files under `out_dir`:
/// `resumen.json`, `cuencas.json`, `embalses.json` (`{"data": [...]}`),
/// `meta.json` once a run has completed, and one `embalses/<nombre>.json`
/// detail per reservoir.
///
/// A name repeated across basins gets the basin appended to its file stem.
pub async fn export_json(pool: &SqlitePool, out_dir: &Path) -> Result<ExportSummary> {
    let detail_dir = out_dir.join("embalses");
    tokio::fs::create_dir_all(&detail_dir)
        .await
        .with_context(|| format!("failed to create {}", detail_dir.display()))?;

    let mut summary = ExportSummary::default();

    match reservoir_queries::run_meta(pool).await {
        Ok(meta) => {
            write_json(&out_dir.join("meta.json"), &meta).await?;
            summary.files += 1;
        }
        Err(QueryError::Unavailable(reason)) => {
            tracing::warn!(reason = %reason, "no completed run, meta.json not written");
        }
        Err(e) => return Err(e.into()),
    }

    let national = reservoir_queries::national_summary(pool).await?;
    write_json(&out_dir.join("resumen.json"), &national).await?;
    let basins = reservoir_queries::basins(pool).await?;
    write_json(&out_dir.join("cuencas.json"), &basins).await?;
    summary.files += 2;

    let reservoirs = all_reservoirs(pool).await?;
    write_json(&out_dir.join("embalses.json"), &ReservoirList { data: &reservoirs }).await?;
    summary.files += 1;

    let mut taken = HashSet::new();
    for snapshot in &reservoirs {
        let detail = reservoir_queries::reservoir_detail(
            pool,
            &snapshot.name,
            Some(&snapshot.basin),
            DateRange::default(),
        )
        .await?;

        let mut stem = file_stem(&snapshot.name);
        if !taken.insert(stem.to_lowercase()) {
            stem = format!("{stem}-{}", file_stem(&snapshot.basin));
            taken.insert(stem.to_lowercase());
        }
        write_json(&detail_dir.join(format!("{stem}.json")), &detail).await?;
        summary.files += 1;
    }
    summary.reservoirs = reservoirs.len();

    tracing::info!(
        out_dir = %out_dir.display(),
        reservoirs = summary.reservoirs,
        files = summary.files,
        "static JSON export written"
    );
    Ok(summary)
}

async fn all_reservoirs(pool: &SqlitePool) -> Result<Vec<ReservoirSnapshot>, QueryError> {
    let filter = ReservoirFilter::default();
    let mut out = Vec::new();
    let mut page = 1;
    loop {
        let pagination = Pagination::new(Some(page), Some(MAX_PER_PAGE as i64), MAX_PER_PAGE, MAX_PER_PAGE);
        let batch = reservoir_queries::list_reservoirs(pool, &filter, pagination).await?;
        out.extend(batch.data);
        if page >= batch.pages {
            return Ok(out);
        }
        page += 1;
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(path, body)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::SqliteLoader;
    use embalses_client::{
        db::{connect_in_memory, init_schema},
        domain::RawRecord,
    };
    use serde_json::Value;
    use time::{macros::date, Date};

    fn record(name: &str, basin: &str, volume: f64, date: Date) -> RawRecord {
        RawRecord {
            name: name.to_string(),
            basin: basin.to_string(),
            region: None,
            capacity_hm3: Some(1000.0),
            volume_hm3: Some(volume),
            percentage: Some(volume / 10.0),
            electric: Some(true),
            date,
        }
    }

    fn read(path: &Path) -> Value {
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }

    #[test]
    fn separators_are_replaced_in_file_stems() {
        assert_eq!(file_stem("Guadalest/Beniarrés"), "Guadalest-Beniarrés");
        assert_eq!(file_stem(r"Bárcena\Vilares"), "Bárcena-Vilares");
        assert_eq!(file_stem("Alcántara"), "Alcántara");
    }

    #[tokio::test]
    async fn writes_every_view_as_files() {
        let pool = connect_in_memory().await.unwrap();
        init_schema(&pool).await.unwrap();
        SqliteLoader::new(pool.clone())
            .load(vec![
                record("Alcántara", "Tajo", 500.0, date!(2024 - 01 - 02)),
                record("Alcántara", "Tajo", 520.0, date!(2024 - 01 - 09)),
                record("Guadalest/Beniarrés", "Júcar", 300.0, date!(2024 - 01 - 09)),
                record("Arenós", "Júcar", 100.0, date!(2024 - 01 - 09)),
                record("Arenós", "Ebro", 200.0, date!(2024 - 01 - 09)),
            ])
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("datos");
        let summary = export_json(&pool, &out).await.unwrap();
        assert_eq!(summary, ExportSummary { reservoirs: 4, files: 8 });

        assert_eq!(read(&out.join("cuencas.json")), serde_json::json!(["Ebro", "Júcar", "Tajo"]));
        assert_eq!(read(&out.join("resumen.json"))["total_embalses"], 4);
        assert_eq!(read(&out.join("meta.json"))["row_count"], 5);

        let list = read(&out.join("embalses.json"));
        let names: Vec<&str> = list["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["nombre"].as_str().unwrap())
            .collect();
        assert_eq!(names, ["Alcántara", "Arenós", "Arenós", "Guadalest/Beniarrés"]);

        let detail = read(&out.join("embalses/Alcántara.json"));
        assert_eq!(detail["historico"].as_array().unwrap().len(), 2);
        assert_eq!(detail["ultimo_dato"]["fecha"], "2024-01-09");
        assert!(out.join("embalses/Guadalest-Beniarrés.json").exists());

        // Ebro sorts first, so the Júcar Arenós gets the suffixed file.
        assert_eq!(read(&out.join("embalses/Arenós.json"))["cuenca"], "Ebro");
        assert_eq!(read(&out.join("embalses/Arenós-Júcar.json"))["cuenca"], "Júcar");
    }

    #[tokio::test]
    async fn empty_store_exports_without_meta() {
        let pool = connect_in_memory().await.unwrap();
        init_schema(&pool).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let summary = export_json(&pool, dir.path()).await.unwrap();
        assert_eq!(summary, ExportSummary { reservoirs: 0, files: 3 });
        assert!(!dir.path().join("meta.json").exists());
        assert_eq!(read(&dir.path().join("embalses.json")), serde_json::json!({"data": []}));
        assert_eq!(read(&dir.path().join("cuencas.json")), serde_json::json!([]));
    }
}
