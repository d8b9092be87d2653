use std::{path::PathBuf, time::Duration};

use async_stream::try_stream;
use embalses_client::domain::RawRecord;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use super::bulletin_archive::{AccessTools, ArchiveFileSource};
use crate::{
    config::FetchConfig,
    pipeline::{EnvelopeStream, PipelineError, Source},
};

/// Downloads the published bulletin archive and streams its records.
///
/// The archive (~50 MB) is streamed to `download_path` chunk by chunk and only
/// renamed into place once complete, so an interrupted download never leaves a
/// truncated archive behind for a later backfill.
#[derive(Clone)]
pub struct HttpBulletinSource {
    client: reqwest::Client,
    archive_url: String,
    page_url: Option<String>,
    download_path: PathBuf,
    channel_capacity: usize,
    access: AccessTools,
}

impl HttpBulletinSource {
    pub fn new(cfg: &FetchConfig) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .user_agent(cfg.user_agent.as_str())
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            archive_url: cfg.archive_url.clone(),
            page_url: cfg.page_url.clone(),
            download_path: cfg.download_path.clone(),
            channel_capacity: cfg.channel_capacity,
            access: AccessTools::from(cfg),
        })
    }

    /// The archive link advertised on the bulletin page, falling back to the
    /// configured archive URL.
    pub async fn resolve_archive_url(&self) -> String {
        if let Some(page_url) = &self.page_url {
            match self.discover(page_url).await {
                Ok(Some(url)) => {
                    tracing::info!(url = %url, "archive URL discovered on bulletin page");
                    return url;
                }
                Ok(None) => {
                    tracing::warn!(page = %page_url, "no archive link on bulletin page, using configured URL");
                }
                Err(e) => {
                    tracing::warn!(page = %page_url, error = %e, "archive URL discovery failed, using configured URL");
                }
            }
        }
        self.archive_url.clone()
    }

    async fn discover(&self, page_url: &str) -> Result<Option<String>, PipelineError> {
        let body = self
            .client
            .get(page_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| PipelineError::Network(format!("failed to fetch bulletin page: {e}")))?
            .text()
            .await
            .map_err(|e| PipelineError::Network(format!("failed to read bulletin page: {e}")))?;

        Ok(find_archive_link(&body, page_url))
    }

    /// Stream `url` into `download_path`, returning the number of bytes written.
    pub async fn download(&self, url: &str) -> Result<u64, PipelineError> {
        let io_err = |e: std::io::Error| PipelineError::Network(format!("failed to store download: {e}"));

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| PipelineError::Network(format!("failed to fetch archive {url}: {e}")))?;

        if let Some(parent) = self.download_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
            }
        }

        let partial = self.download_path.with_extension("part");
        let mut file = tokio::fs::File::create(&partial).await.map_err(io_err)?;
        let mut body = response.bytes_stream();
        let mut written: u64 = 0;

        while let Some(chunk) = body.next().await {
            let chunk = chunk
                .map_err(|e| PipelineError::Network(format!("archive download interrupted: {e}")))?;
            file.write_all(&chunk).await.map_err(io_err)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(io_err)?;
        drop(file);

        tokio::fs::rename(&partial, &self.download_path)
            .await
            .map_err(io_err)?;

        metrics::counter!("bulletin_download_bytes_total").increment(written);
        Ok(written)
    }
}

#[async_trait::async_trait]
impl Source<RawRecord> for HttpBulletinSource {
    async fn stream(&self) -> EnvelopeStream<RawRecord> {
        let this = self.clone();

        let s = try_stream! {
            let url = this.resolve_archive_url().await;
            let bytes = this.download(&url).await?;
            tracing::info!(url = %url, bytes, path = %this.download_path.display(), "bulletin archive downloaded");

            let mut records = ArchiveFileSource::new(&this.download_path, this.channel_capacity)
                .with_access_tools(this.access.clone())
                .stream()
                .await;
            while let Some(item) = records.next().await {
                yield item?;
            }
        };

        Box::pin(s)
    }
}

/// First `href` on the page pointing at a `BD-Embalses*.zip`, resolved against
/// the page URL.
pub fn find_archive_link(html: &str, page_url: &str) -> Option<String> {
    let base = reqwest::Url::parse(page_url).ok()?;

    html.match_indices("href=")
        .filter_map(|(idx, _)| {
            let rest = &html[idx + "href=".len()..];
            let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
            let value = &rest[1..];
            value.find(quote).map(|end| &value[..end])
        })
        .filter(|href| {
            href.contains("BD-Embalses") && href.to_ascii_lowercase().ends_with(".zip")
        })
        .find_map(|href| base.join(href).ok())
        .map(|url| url.to_string())
}
