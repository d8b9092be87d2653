use serde::Deserialize;
use std::{fs, path::PathBuf};

pub const DEFAULT_ARCHIVE_URL: &str = "https://www.miteco.gob.es/content/dam/miteco/es/agua/temas/\
evaluacion-de-los-recursos-hidricos/boletin-hidrologico/Historico-de-embalses/BD-Embalses.zip";

pub const DEFAULT_PAGE_URL: &str =
    "https://www.miteco.gob.es/es/agua/temas/evaluacion-de-los-recursos-hidricos/boletin-hidrologico.html";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "embalses.db".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub archive_url: String,
    /// Bulletin page scanned for the current archive link; `None` disables discovery.
    pub page_url: Option<String>,
    pub download_path: PathBuf,
    pub user_agent: String,
    pub timeout_secs: u64,
    pub channel_capacity: usize,
    /// `mdb-tables` invocation (program then leading arguments) for Access archives.
    pub mdb_tables_cmd: Vec<String>,
    pub mdb_export_cmd: Vec<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            archive_url: DEFAULT_ARCHIVE_URL.to_string(),
            page_url: Some(DEFAULT_PAGE_URL.to_string()),
            download_path: PathBuf::from("data/BD-Embalses.zip"),
            user_agent: format!("embalses/{} (+reservoir bulletin mirror)", env!("CARGO_PKG_VERSION")),
            timeout_secs: 300,
            channel_capacity: 1024,
            mdb_tables_cmd: vec!["mdb-tables".to_string()],
            mdb_export_cmd: vec!["mdb-export".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_addr: String,
    pub default_per_page: u32,
    pub max_per_page: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5000".to_string(),
            default_per_page: embalses_client::db::reservoir_queries::DEFAULT_PER_PAGE,
            max_per_page: embalses_client::db::reservoir_queries::MAX_PER_PAGE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Directory receiving the static JSON snapshot.
    pub out_dir: PathBuf,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("datos"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub fetch: FetchConfig,
    pub api: ApiConfig,
    pub export: ExportConfig,
    pub metrics: Option<MetricsConfig>,
}

impl AppConfig {
    /// Load from `EMBALSES_CONFIG` (default `embalses.toml`). A missing file
    /// means every setting keeps its default.
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("EMBALSES_CONFIG").unwrap_or_else(|_| "embalses.toml".to_string());
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path, "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(anyhow::anyhow!("failed to read config {path}: {e}")),
        };
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        Ok(cfg)
    }
}
