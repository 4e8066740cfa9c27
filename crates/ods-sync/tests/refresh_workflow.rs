use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ods_core::{DatasetReference, DownloadFormat, RefreshOutcome, SkipReason};
use ods_storage::{sha256_hex, write_atomically, DatasetDownloader, DownloadedFile};
use ods_sync::{SyncConfig, SyncPipeline};
use serde_json::Value as JsonValue;
use tempfile::tempdir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Default)]
struct RecordingDownloader {
    urls: Mutex<Vec<String>>,
}

#[async_trait]
impl DatasetDownloader for RecordingDownloader {
    async fn download(&self, url: &str, destination: &Path) -> anyhow::Result<DownloadedFile> {
        let call = {
            let mut urls = self.urls.lock().unwrap();
            urls.push(url.to_string());
            urls.len()
        };
        let body = format!("export #{call}\n").into_bytes();
        write_atomically(destination, &body).await?;
        Ok(DownloadedFile {
            path: destination.to_path_buf(),
            byte_size: body.len(),
            content_hash: sha256_hex(&body),
        })
    }
}

fn catalog_fixture() -> JsonValue {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/catalog/abcd-1234.json");
    serde_json::from_str(&std::fs::read_to_string(path).expect("fixture")).expect("json")
}

async fn mount_catalog(server: &MockServer, body: JsonValue) {
    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/api/catalog/v1"))
        .and(query_param("ids", "abcd-1234"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn refresh_skip_then_archive_across_invocations() {
    let server = MockServer::start().await;
    let root = tempdir().expect("tempdir");
    let mut config = SyncConfig::new(root.path());
    config.catalog_url = server.uri();

    let downloader = Arc::new(RecordingDownloader::default());
    let pipeline = SyncPipeline::new(config)
        .await
        .expect("pipeline")
        .with_downloader(downloader.clone());
    pipeline.migrate().await.expect("migrate");
    let reference = DatasetReference::new("abcd-1234");

    // First invocation: no prior audit record.
    mount_catalog(&server, catalog_fixture()).await;
    let first = pipeline.run_once(&reference).await.expect("first run");

    let current = root
        .path()
        .join("data")
        .join("building_permits_2006_to_present.csv");
    assert_eq!(first.download_format, DownloadFormat::Csv);
    assert_eq!(first.outcome, RefreshOutcome::Refreshed(current.clone()));
    {
        let urls = downloader.urls.lock().unwrap();
        assert_eq!(urls.len(), 1);
        assert!(urls[0].ends_with("/rows.csv?accessType=DOWNLOAD"));
    }
    let history = pipeline.history("abcd-1234", 10).await.expect("history");
    assert_eq!(history.len(), 1);
    assert!(history[0].record.was_refreshed);
    assert_eq!(
        history[0].record.source_last_modified.to_rfc3339(),
        "2024-06-01T00:00:00+00:00"
    );
    assert!(root.path().join("db").join(ods_sync::AUDIT_DB_FILE).exists());

    // Second invocation: catalog unchanged.
    let second = pipeline.run_once(&reference).await.expect("second run");
    assert!(matches!(
        second.outcome,
        RefreshOutcome::Skipped(SkipReason::UpToDate { .. })
    ));
    assert_eq!(downloader.urls.lock().unwrap().len(), 1);
    assert_eq!(pipeline.history("abcd-1234", 10).await.unwrap().len(), 1);

    // Third invocation: the source moved forward.
    let mut newer = catalog_fixture();
    newer["results"][0]["resource"]["data_updated_at"] =
        JsonValue::String("2024-07-15T06:30:00.412Z".to_string());
    mount_catalog(&server, newer).await;
    let third = pipeline.run_once(&reference).await.expect("third run");

    assert!(third.outcome.is_refreshed());
    let archived = root
        .path()
        .join("data")
        .join("archive")
        .join("building_permits_2006_to_present_2024_06_01__00_00_00.csv");
    assert_eq!(std::fs::read_to_string(archived).unwrap(), "export #1\n");
    assert_eq!(std::fs::read_to_string(&current).unwrap(), "export #2\n");
    assert_eq!(pipeline.history("abcd-1234", 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn catalog_failure_aborts_without_side_effects() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let root = tempdir().expect("tempdir");
    let mut config = SyncConfig::new(root.path());
    config.catalog_url = server.uri();
    let downloader = Arc::new(RecordingDownloader::default());
    let pipeline = SyncPipeline::new(config)
        .await
        .expect("pipeline")
        .with_downloader(downloader.clone());

    let err = pipeline
        .run_once(&DatasetReference::new("abcd-1234"))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("status code 503"));
    assert!(downloader.urls.lock().unwrap().is_empty());
    assert!(pipeline.history("abcd-1234", 10).await.unwrap().is_empty());
    assert!(!root.path().join("data").exists());
}
