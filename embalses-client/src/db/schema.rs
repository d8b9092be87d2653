//! SQLite schema shared by the loader (writer) and the query API (readers).

use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

pub const CREATE_RESERVOIRS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS reservoirs (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        name         TEXT    NOT NULL,
        name_key     TEXT    NOT NULL,
        sort_key     TEXT    NOT NULL DEFAULT '',
        basin        TEXT    NOT NULL,
        region       TEXT,
        capacity_hm3 REAL,
        electric     BOOLEAN,
        UNIQUE (name, basin)
    )
"#;

pub const CREATE_OBSERVATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS observations (
        reservoir_id INTEGER NOT NULL REFERENCES reservoirs (id),
        obs_date     DATE    NOT NULL,
        volume_hm3   REAL,
        percentage   REAL,
        PRIMARY KEY (reservoir_id, obs_date)
    )
"#;

pub const CREATE_RUN_META_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS run_meta (
        id           INTEGER PRIMARY KEY CHECK (id = 1),
        last_updated TEXT    NOT NULL,
        row_count    INTEGER NOT NULL
    )
"#;

const CREATE_INDEXES: [&str; 4] = [
    "CREATE INDEX IF NOT EXISTS idx_reservoirs_name_key ON reservoirs (name_key)",
    "CREATE INDEX IF NOT EXISTS idx_reservoirs_sort_key ON reservoirs (sort_key)",
    "CREATE INDEX IF NOT EXISTS idx_reservoirs_basin ON reservoirs (basin)",
    "CREATE INDEX IF NOT EXISTS idx_observations_date ON observations (obs_date)",
];

/// Open (creating if needed) the store file in WAL mode so readers never block
/// on, or observe, an open ingestion transaction.
pub async fn connect(path: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    let opts = SqliteConnectOptions::new()
        .filename(path)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(30))
        .foreign_keys(true)
        .create_if_missing(true);

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(opts)
        .await
}

/// Single-connection in-memory store. The connection is never recycled, since
/// dropping it would discard the database.
pub async fn connect_in_memory() -> Result<SqlitePool, sqlx::Error> {
    let opts = SqliteConnectOptions::new()
        .filename(":memory:")
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(opts)
        .await
}

/// Collation key for reservoir names: lowercase with accents stripped, so
/// `Órbigo` sorts among the `o`s instead of after `Z`.
pub fn sort_key(name: &str) -> String {
    name.trim()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Stores created before `sort_key` existed get the column and its values.
async fn migrate_sort_key(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let columns: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_table_info('reservoirs')")
        .fetch_all(pool)
        .await?;
    if !columns.iter().any(|c| c == "sort_key") {
        sqlx::query("ALTER TABLE reservoirs ADD COLUMN sort_key TEXT NOT NULL DEFAULT ''")
            .execute(pool)
            .await?;
    }

    let pending: Vec<(i64, String)> = sqlx::query_as("SELECT id, name FROM reservoirs WHERE sort_key = ''")
        .fetch_all(pool)
        .await?;
    if pending.is_empty() {
        return Ok(());
    }

    let mut tx = pool.begin().await?;
    for (id, name) in &pending {
        sqlx::query("UPDATE reservoirs SET sort_key = ? WHERE id = ?")
            .bind(sort_key(name))
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(CREATE_RESERVOIRS_TABLE).execute(pool).await?;
    migrate_sort_key(pool).await?;
    sqlx::query(CREATE_OBSERVATIONS_TABLE).execute(pool).await?;
    sqlx::query(CREATE_RUN_META_TABLE).execute(pool).await?;
    for stmt in CREATE_INDEXES {
        sqlx::query(stmt).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_schema_is_idempotent() {
        let pool = connect_in_memory().await.unwrap();
        init_schema(&pool).await.unwrap();
        init_schema(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(tables, vec!["observations", "reservoirs", "run_meta"]);
    }

    #[test]
    fn sort_key_folds_case_and_accents() {
        assert_eq!(sort_key("Órbigo"), "orbigo");
        assert_eq!(sort_key(" Entrepeñas "), "entrepenas");
        assert_eq!(sort_key("ALCÁNTARA"), "alcantara");
        assert!(sort_key("Órbigo") < sort_key("Zújar"));
        assert!(sort_key("Úbeda") > sort_key("Tous"));
    }

    #[tokio::test]
    async fn sort_key_is_added_to_older_stores() {
        let pool = connect_in_memory().await.unwrap();
        sqlx::query(
            "CREATE TABLE reservoirs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                name_key TEXT NOT NULL,
                basin TEXT NOT NULL,
                region TEXT,
                capacity_hm3 REAL,
                electric BOOLEAN,
                UNIQUE (name, basin)
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO reservoirs (name, name_key, basin) VALUES ('Órbigo', 'órbigo', 'Duero')")
            .execute(&pool)
            .await
            .unwrap();

        init_schema(&pool).await.unwrap();

        let key: String = sqlx::query_scalar("SELECT sort_key FROM reservoirs WHERE name = 'Órbigo'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(key, "orbigo");
    }

    #[tokio::test]
    async fn duplicate_observation_key_is_rejected() {
        let pool = connect_in_memory().await.unwrap();
        init_schema(&pool).await.unwrap();

        sqlx::query("INSERT INTO reservoirs (name, name_key, basin) VALUES ('Entrepeñas', 'entrepeñas', 'Tajo')")
            .execute(&pool)
            .await
            .unwrap();
        let insert = "INSERT INTO observations (reservoir_id, obs_date, volume_hm3) VALUES (1, '2024-01-02', 10.0)";
        sqlx::query(insert).execute(&pool).await.unwrap();
        assert!(sqlx::query(insert).execute(&pool).await.is_err());
    }
}
