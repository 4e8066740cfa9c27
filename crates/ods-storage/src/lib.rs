//! Data-directory layout, archiving, and HTTP fetch/download utilities for ODS.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ods_core::{truncate_to_seconds, DownloadFormat};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ods-storage";

pub const DATA_DIR_NAME: &str = "data";
pub const ARCHIVE_DIR_NAME: &str = "archive";
pub const DB_DIR_NAME: &str = "db";

/// Suffix format embedded in archived file names.
pub const ARCHIVE_STAMP_FORMAT: &str = "%Y_%m_%d__%H_%M_%S";

/// Project directory layout: `data/`, `data/archive/` and `db/` under a single root.
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR_NAME)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.data_dir().join(ARCHIVE_DIR_NAME)
    }

    pub fn db_dir(&self) -> PathBuf {
        self.root.join(DB_DIR_NAME)
    }

    /// Canonical location of the current copy: `{data}/{display_name}.{format}`.
    pub fn current_file(&self, display_name: &str, format: DownloadFormat) -> PathBuf {
        self.data_dir().join(format!("{display_name}.{format}"))
    }

    /// Like [`DataLayout::current_file`], but rejects names that would place the file
    /// anywhere other than directly inside `data/` (separators, `..`, absolute paths).
    pub fn checked_current_file(
        &self,
        display_name: &str,
        format: DownloadFormat,
    ) -> Result<PathBuf, ArchiveError> {
        let path = self.current_file(display_name, format);
        if path.parent() != Some(self.data_dir().as_path()) {
            return Err(ArchiveError::Location { path });
        }
        Ok(path)
    }

    pub async fn ensure(&self) -> anyhow::Result<()> {
        for dir in [self.data_dir(), self.archive_dir(), self.db_dir()] {
            fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("refusing to archive {}: expected the file to live in a `data` directory", .path.display())]
    Location { path: PathBuf },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ArchiveError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

fn ensure_in_data_dir(file_path: &Path) -> Result<&Path, ArchiveError> {
    match file_path.parent() {
        Some(dir) if dir.file_name().is_some_and(|name| name == DATA_DIR_NAME) => Ok(dir),
        _ => Err(ArchiveError::Location {
            path: file_path.to_path_buf(),
        }),
    }
}

/// `foo.csv` + 2023-05-01T10:00:00Z -> `foo_2023_05_01__10_00_00.csv`.
pub fn archive_file_name(file_path: &Path, stamp: DateTime<Utc>) -> Option<String> {
    let stem = file_path.file_stem()?.to_string_lossy();
    let suffix = stamp.format(ARCHIVE_STAMP_FORMAT);
    Some(match file_path.extension() {
        Some(ext) => format!("{stem}_{suffix}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{suffix}"),
    })
}

/// Copy the current data file into `data/archive/` under a timestamp-suffixed name.
///
/// The location check runs before anything else so a file outside `data/` is never
/// archived, even if it does not exist yet. A missing file yields `Ok(None)`. The
/// original is left in place.
pub async fn archive_data_file(
    file_path: &Path,
    stamp: DateTime<Utc>,
) -> Result<Option<PathBuf>, ArchiveError> {
    let data_dir = ensure_in_data_dir(file_path)?;

    let exists = fs::try_exists(file_path)
        .await
        .map_err(|e| ArchiveError::io(format!("checking {}", file_path.display()), e))?;
    if !exists {
        return Ok(None);
    }

    let archive_dir = data_dir.join(ARCHIVE_DIR_NAME);
    fs::create_dir_all(&archive_dir)
        .await
        .map_err(|e| ArchiveError::io(format!("creating {}", archive_dir.display()), e))?;

    let Some(name) = archive_file_name(file_path, stamp) else {
        return Err(ArchiveError::Location {
            path: file_path.to_path_buf(),
        });
    };
    let destination = archive_dir.join(name);
    fs::copy(file_path, &destination).await.map_err(|e| {
        ArchiveError::io(
            format!(
                "copying {} -> {}",
                file_path.display(),
                destination.display()
            ),
            e,
        )
    })?;

    info!(
        source = %file_path.display(),
        archive = %destination.display(),
        "archived previous data file"
    );
    Ok(Some(destination))
}

/// Last-modified time of a file on disk, truncated to whole seconds.
pub async fn file_modified_at(path: &Path) -> anyhow::Result<Option<DateTime<Utc>>> {
    if !fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        return Ok(None);
    }
    let modified = fs::metadata(path)
        .await
        .and_then(|meta| meta.modified())
        .with_context(|| format!("reading modification time of {}", path.display()))?;
    Ok(Some(truncate_to_seconds(DateTime::<Utc>::from(modified))))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write bytes through a sibling temp file and rename over `destination`.
pub async fn write_atomically(destination: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = destination
        .parent()
        .with_context(|| format!("{} has no parent directory", destination.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, destination).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                destination.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct HttpClientConfig {
    /// `None` leaves requests unbounded; schedulers wrapping a run should impose their own limit.
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

/// Status plus decoded JSON body. Non-success bodies that are not JSON decode to `Null`.
#[derive(Debug, Clone)]
pub struct JsonResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: JsonValue,
}

#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub byte_size: usize,
    pub content_hash: String,
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// Single GET returning the status and JSON body; the caller decides what a status means.
    pub async fn get_json(&self, url: &str) -> Result<JsonResponse, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .instrument(info_span!("http_get_json", url))
            .await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let bytes = resp.bytes().await?;

        let body = if bytes.is_empty() {
            JsonValue::Null
        } else {
            match serde_json::from_slice(&bytes) {
                Ok(value) => value,
                Err(_) if !status.is_success() => JsonValue::Null,
                Err(source) => {
                    return Err(FetchError::Decode {
                        url: final_url,
                        source,
                    })
                }
            }
        };

        Ok(JsonResponse {
            status,
            final_url,
            body,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .instrument(info_span!("http_fetch", url))
            .await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

/// Capability for pulling a dataset export onto local disk.
#[async_trait]
pub trait DatasetDownloader: Send + Sync {
    async fn download(&self, url: &str, destination: &Path) -> anyhow::Result<DownloadedFile>;
}

#[async_trait]
impl DatasetDownloader for HttpFetcher {
    async fn download(&self, url: &str, destination: &Path) -> anyhow::Result<DownloadedFile> {
        let fetched = self
            .fetch_bytes(url)
            .await
            .with_context(|| format!("downloading {url}"))?;
        write_atomically(destination, &fetched.body).await?;

        let downloaded = DownloadedFile {
            path: destination.to_path_buf(),
            byte_size: fetched.body.len(),
            content_hash: sha256_hex(&fetched.body),
        };
        info!(
            url = %fetched.final_url,
            path = %destination.display(),
            bytes = downloaded.byte_size,
            sha256 = %downloaded.content_hash,
            "downloaded dataset export"
        );
        Ok(downloaded)
    }
}
