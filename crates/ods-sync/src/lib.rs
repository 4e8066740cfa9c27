//! Freshness-driven refresh workflow: audit store, refresh coordinator and the
//! one-dataset-per-invocation pipeline.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ods_catalog::{DatasetMetadata, MetadataResolver, DEFAULT_CATALOG_URL};
use ods_core::{DatasetReference, DownloadFormat, FreshnessRecord, RefreshOutcome, SkipReason};
use ods_storage::{
    archive_data_file, file_modified_at, DataLayout, DatasetDownloader, HttpClientConfig,
    HttpFetcher,
};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, Instrument};

pub const CRATE_NAME: &str = "ods-sync";

pub const AUDIT_DB_FILE: &str = "dwh_metadata.sqlite";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub project_root: PathBuf,
    pub catalog_url: String,
    pub audit_db: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: Option<u64>,
}

impl SyncConfig {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            catalog_url: DEFAULT_CATALOG_URL.to_string(),
            audit_db: None,
            user_agent: "ods-bot/0.1".to_string(),
            http_timeout_secs: None,
        }
    }

    pub fn from_env() -> Self {
        Self {
            project_root: std::env::var("ODS_PROJECT_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            catalog_url: std::env::var("ODS_CATALOG_URL")
                .unwrap_or_else(|_| DEFAULT_CATALOG_URL.to_string()),
            audit_db: std::env::var("ODS_AUDIT_DB").ok().map(PathBuf::from),
            user_agent: std::env::var("ODS_USER_AGENT")
                .unwrap_or_else(|_| "ods-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("ODS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }

    pub fn layout(&self) -> DataLayout {
        DataLayout::new(self.project_root.clone())
    }

    pub fn audit_db_path(&self) -> PathBuf {
        self.audit_db
            .clone()
            .unwrap_or_else(|| self.layout().db_dir().join(AUDIT_DB_FILE))
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout_secs.map(Duration::from_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit store query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// A persisted freshness row together with its auto-incremented id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    #[serde(flatten)]
    pub record: FreshnessRecord,
}

/// Append-only log of freshness decisions.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn migrate(&self) -> Result<(), AuditError>;

    async fn insert(&self, record: &FreshnessRecord) -> Result<i64, AuditError>;

    /// Row with the greatest source timestamp among refreshed rows for the dataset.
    async fn latest_refreshed(&self, dataset_id: &str) -> Result<Option<FreshnessRecord>, AuditError>;

    /// Newest rows first.
    async fn history(&self, dataset_id: &str, limit: u32) -> Result<Vec<AuditEntry>, AuditError>;
}

const CREATE_FRESHNESS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS freshness_checks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    dataset_id TEXT NOT NULL,
    dataset_name TEXT NOT NULL,
    source_data_last_modified TEXT NOT NULL,
    dwh_data_updated BOOLEAN NOT NULL DEFAULT FALSE,
    time_of_metadata_check TEXT NOT NULL
)
"#;

const CREATE_FRESHNESS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_freshness_checks_dataset
    ON freshness_checks (dataset_id, dwh_data_updated)
"#;

#[derive(Debug, Clone)]
pub struct SqliteAuditStore {
    pool: SqlitePool,
}

impl SqliteAuditStore {
    /// Open (creating if needed) the database file and apply the schema.
    pub async fn connect(path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|source| AuditError::Io {
                context: format!("creating audit directory {}", parent.display()),
                source,
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store; contents vanish with the pool.
    pub async fn in_memory() -> Result<Self, AuditError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<FreshnessRecord, sqlx::Error> {
    Ok(FreshnessRecord {
        dataset_id: row.try_get("dataset_id")?,
        dataset_name: row.try_get("dataset_name")?,
        source_last_modified: row.try_get("source_data_last_modified")?,
        was_refreshed: row.try_get("dwh_data_updated")?,
        checked_at: row.try_get("time_of_metadata_check")?,
    })
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn migrate(&self) -> Result<(), AuditError> {
        sqlx::query(CREATE_FRESHNESS_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_FRESHNESS_INDEX).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert(&self, record: &FreshnessRecord) -> Result<i64, AuditError> {
        let result = sqlx::query(
            r#"
            INSERT INTO freshness_checks (
                dataset_id, dataset_name, source_data_last_modified,
                dwh_data_updated, time_of_metadata_check
            ) VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.dataset_id)
        .bind(&record.dataset_name)
        .bind(record.source_last_modified)
        .bind(record.was_refreshed)
        .bind(record.checked_at)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn latest_refreshed(&self, dataset_id: &str) -> Result<Option<FreshnessRecord>, AuditError> {
        let row = sqlx::query(
            r#"
            SELECT dataset_id, dataset_name, source_data_last_modified,
                   dwh_data_updated, time_of_metadata_check
            FROM freshness_checks
            WHERE dataset_id = ? AND dwh_data_updated = TRUE
            ORDER BY source_data_last_modified DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(dataset_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    async fn history(&self, dataset_id: &str, limit: u32) -> Result<Vec<AuditEntry>, AuditError> {
        let rows = sqlx::query(
            r#"
            SELECT id, dataset_id, dataset_name, source_data_last_modified,
                   dwh_data_updated, time_of_metadata_check
            FROM freshness_checks
            WHERE dataset_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(dataset_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<AuditEntry, AuditError> {
                Ok(AuditEntry {
                    id: row.try_get("id")?,
                    record: record_from_row(row)?,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshDecision {
    /// Proceed; `previous` is the last refreshed source timestamp, if any.
    Refresh { previous: Option<DateTime<Utc>> },
    Skip(SkipReason),
}

/// Refresh iff nothing was recorded or the source moved strictly forward.
pub fn decide_refresh(incoming: DateTime<Utc>, recorded: Option<DateTime<Utc>>) -> RefreshDecision {
    match recorded {
        None => RefreshDecision::Refresh { previous: None },
        Some(recorded) if incoming > recorded => RefreshDecision::Refresh {
            previous: Some(recorded),
        },
        Some(recorded) if incoming == recorded => {
            RefreshDecision::Skip(SkipReason::UpToDate { recorded })
        }
        Some(recorded) => RefreshDecision::Skip(SkipReason::SourceOlder { incoming, recorded }),
    }
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("catalog reports no last-modified timestamp for dataset {dataset_id}")]
    MissingSourceTimestamp { dataset_id: String },
    #[error("catalog reports no data domain for dataset {dataset_id}; cannot build a download URL")]
    MissingDomain { dataset_id: String },
    #[error("metadata for dataset {actual} does not match requested dataset {expected}")]
    DatasetMismatch { expected: String, actual: String },
}

/// Decides whether a dataset is stale and, if so, archives, downloads and audits it.
///
/// Runs for the same dataset id must be serialized by the caller: the read of the
/// latest refreshed row and the final insert are not guarded against each other.
pub struct RefreshCoordinator {
    layout: DataLayout,
    audit: Arc<dyn AuditStore>,
    downloader: Arc<dyn DatasetDownloader>,
}

impl RefreshCoordinator {
    pub fn new(
        layout: DataLayout,
        audit: Arc<dyn AuditStore>,
        downloader: Arc<dyn DatasetDownloader>,
    ) -> Self {
        Self {
            layout,
            audit,
            downloader,
        }
    }

    pub async fn run(
        &self,
        reference: &DatasetReference,
        metadata: &DatasetMetadata,
    ) -> Result<RefreshOutcome> {
        let span = info_span!("refresh", dataset_id = %reference.id);
        self.run_inner(reference, metadata).instrument(span).await
    }

    async fn run_inner(
        &self,
        reference: &DatasetReference,
        metadata: &DatasetMetadata,
    ) -> Result<RefreshOutcome> {
        if reference.id != metadata.dataset_id() {
            return Err(RefreshError::DatasetMismatch {
                expected: reference.id.clone(),
                actual: metadata.dataset_id().to_string(),
            }
            .into());
        }

        let incoming = metadata
            .source_last_modified()
            .ok_or_else(|| RefreshError::MissingSourceTimestamp {
                dataset_id: reference.id.clone(),
            })?;
        let recorded = self
            .audit
            .latest_refreshed(&reference.id)
            .await
            .context("reading last refreshed freshness record")?
            .map(|record| record.source_last_modified);

        let previous = match decide_refresh(incoming, recorded) {
            RefreshDecision::Skip(reason) => {
                info!(
                    dataset = metadata.display_name(),
                    %reason,
                    "not downloading"
                );
                return Ok(RefreshOutcome::Skipped(reason));
            }
            RefreshDecision::Refresh { previous } => previous,
        };

        let url = metadata
            .download_url()
            .ok_or_else(|| RefreshError::MissingDomain {
                dataset_id: reference.id.clone(),
            })?;
        let current = self
            .layout
            .checked_current_file(metadata.display_name(), metadata.download_format())?;

        // Archive must finish before the download overwrites `current`.
        let stamp = match previous {
            Some(previous) => Some(previous),
            None => file_modified_at(&current).await?,
        };
        if let Some(stamp) = stamp {
            archive_data_file(&current, stamp).await?;
        }

        self.downloader.download(url, &current).await?;

        let record = FreshnessRecord {
            dataset_id: reference.id.clone(),
            dataset_name: metadata.display_name().to_string(),
            source_last_modified: incoming,
            was_refreshed: true,
            checked_at: metadata.checked_at(),
        };
        self.audit
            .insert(&record)
            .await
            .context("recording freshness check")?;

        info!(path = %current.display(), "refreshed local copy");
        Ok(RefreshOutcome::Refreshed(current))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub dataset_id: String,
    pub display_name: String,
    pub download_format: DownloadFormat,
    pub source_last_modified: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RefreshOutcome,
}

/// Wires resolver, audit store and coordinator for a single invocation.
pub struct SyncPipeline {
    config: SyncConfig,
    resolver: MetadataResolver,
    audit: Arc<SqliteAuditStore>,
    coordinator: RefreshCoordinator,
}

impl SyncPipeline {
    pub async fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let audit_path = config.audit_db_path();
        let audit = Arc::new(
            SqliteAuditStore::connect(&audit_path)
                .await
                .with_context(|| format!("opening audit store {}", audit_path.display()))?,
        );
        let resolver = MetadataResolver::new(http.clone(), config.catalog_url.clone());
        let coordinator = RefreshCoordinator::new(config.layout(), audit.clone(), Arc::new(http));

        Ok(Self {
            config,
            resolver,
            audit,
            coordinator,
        })
    }

    pub fn with_downloader(mut self, downloader: Arc<dyn DatasetDownloader>) -> Self {
        self.coordinator = RefreshCoordinator::new(self.config.layout(), self.audit.clone(), downloader);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Create the data directories and audit schema.
    pub async fn migrate(&self) -> Result<()> {
        self.config.layout().ensure().await?;
        self.audit.migrate().await.context("applying audit schema")?;
        Ok(())
    }

    pub async fn resolve(&self, reference: &DatasetReference) -> Result<DatasetMetadata> {
        Ok(self.resolver.resolve(reference).await?)
    }

    pub async fn history(&self, dataset_id: &str, limit: u32) -> Result<Vec<AuditEntry>> {
        Ok(self.audit.history(dataset_id, limit).await?)
    }

    pub async fn run_once(&self, reference: &DatasetReference) -> Result<RefreshSummary> {
        let started_at = Utc::now();
        let metadata = self.resolve(reference).await?;
        let outcome = self.coordinator.run(reference, &metadata).await?;

        Ok(RefreshSummary {
            dataset_id: reference.id.clone(),
            display_name: metadata.display_name().to_string(),
            download_format: metadata.download_format(),
            source_last_modified: metadata.source_last_modified(),
            started_at,
            finished_at: Utc::now(),
            outcome,
        })
    }
}
