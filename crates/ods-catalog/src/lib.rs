//! Catalog metadata resolution: fetches a dataset's catalog record and derives the
//! facts the refresh workflow depends on (name, domain, geospatial flag, format, URL,
//! last-modified timestamps).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ods_core::{
    normalize_identifier, parse_catalog_timestamp, truncate_to_seconds, DatasetReference,
    DownloadFormat, UnsupportedFormatError,
};
use ods_storage::{FetchError, HttpFetcher};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "ods-catalog";

pub const DEFAULT_CATALOG_URL: &str = "http://api.us.socrata.com";

/// Column datatypes that mark a dataset as geospatial.
pub const GEO_COLUMN_TYPES: &[&str] = &[
    "Line",
    "Location",
    "MultiLine",
    "MultiPoint",
    "MultiPolygon",
    "Point",
    "Polygon",
];

/// Short descriptor name -> resource key holding the per-column values.
const COLUMN_FIELDS: &[(&str, &str)] = &[
    ("name", "columns_name"),
    ("field_name", "columns_field_name"),
    ("datatype", "columns_datatype"),
    ("description", "columns_description"),
    ("format", "columns_format"),
];

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog request for dataset {dataset_id} failed with status code {status}")]
    MetadataFetch { dataset_id: String, status: u16 },
    #[error("catalog returned no record for dataset {dataset_id}")]
    DatasetNotFound { dataset_id: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    UnsupportedFormat(#[from] UnsupportedFormatError),
}

/// Optional-field view over a catalog JSON object. Lookups never fail: a missing key,
/// an explicit `null`, or a value of the wrong shape all read as `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct AttributeMap(Map<String, JsonValue>);

impl AttributeMap {
    pub fn from_value(value: Option<&JsonValue>) -> Option<Self> {
        value.and_then(JsonValue::as_object).cloned().map(Self)
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(JsonValue::as_str)
    }

    pub fn get_array(&self, key: &str) -> Option<&Vec<JsonValue>> {
        self.get(key).and_then(JsonValue::as_array)
    }

    pub fn get_object(&self, key: &str) -> Option<AttributeMap> {
        Self::from_value(self.get(key))
    }

    pub fn get_timestamp(&self, key: &str) -> Option<DateTime<Utc>> {
        let raw = self.get_str(key)?;
        let parsed = parse_catalog_timestamp(raw);
        if parsed.is_none() {
            warn!(key, raw, "ignoring unparseable catalog timestamp");
        }
        parsed
    }
}

/// The three signals feeding the geospatial classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GeoSignals {
    pub has_data_columns: bool,
    pub has_geo_view: bool,
    pub has_geo_column_type: bool,
}

impl GeoSignals {
    pub fn from_resource(resource: Option<&AttributeMap>) -> Self {
        let Some(resource) = resource else {
            return Self {
                has_data_columns: false,
                has_geo_view: false,
                has_geo_column_type: false,
            };
        };

        let has_data_columns = resource
            .get_array("columns_name")
            .is_some_and(|names| !names.is_empty());
        let has_geo_view = resource.get_str("lens_view_type") == Some("geo")
            || resource.get_str("lens_display_type") == Some("map");
        let has_geo_column_type = resource.get_array("columns_datatype").is_some_and(|types| {
            types
                .iter()
                .filter_map(JsonValue::as_str)
                .any(|t| GEO_COLUMN_TYPES.contains(&t))
        });

        Self {
            has_data_columns,
            has_geo_view,
            has_geo_column_type,
        }
    }

    /// Map-style view with no flat columns, or any explicitly geo-typed column.
    pub fn is_geospatial(&self) -> bool {
        (!self.has_data_columns && self.has_geo_view) || self.has_geo_column_type
    }
}

pub fn build_download_url(
    domain: &str,
    dataset_id: &str,
    format: DownloadFormat,
    is_geospatial: bool,
) -> String {
    if is_geospatial {
        format!("https://{domain}/api/geospatial/{dataset_id}?method=export&format={format}")
    } else {
        format!("https://{domain}/api/views/{dataset_id}/rows.{format}?accessType=DOWNLOAD")
    }
}

/// Facts derived once from a catalog record and the caller's reference. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetMetadata {
    dataset_id: String,
    resource_block: Option<AttributeMap>,
    display_name: String,
    domain: Option<String>,
    column_descriptors: BTreeMap<String, Vec<JsonValue>>,
    geo_signals: GeoSignals,
    is_geospatial: bool,
    download_format: DownloadFormat,
    download_url: Option<String>,
    source_last_modified: Option<DateTime<Utc>>,
    metadata_last_modified: Option<DateTime<Utc>>,
    checked_at: DateTime<Utc>,
}

impl DatasetMetadata {
    /// Derive metadata from one element of the catalog's `results` array.
    pub fn from_catalog_record(
        reference: &DatasetReference,
        record: &JsonValue,
        checked_at: DateTime<Utc>,
    ) -> Result<Self, UnsupportedFormatError> {
        let record = AttributeMap::from_value(Some(record)).unwrap_or_default();
        let resource_block = record.get_object("resource");
        let resource = resource_block.as_ref();

        let display_name = match &reference.display_name {
            Some(name) => name.clone(),
            None => {
                let from_catalog = resource
                    .and_then(|r| r.get_str("name"))
                    .map(normalize_identifier)
                    .filter(|name| !name.is_empty());
                from_catalog.unwrap_or_else(|| normalize_identifier(&reference.id.replace('-', " ")))
            }
        };

        let domain = record
            .get_object("metadata")
            .and_then(|m| m.get_str("domain").map(str::to_string));

        let column_descriptors: BTreeMap<String, Vec<JsonValue>> = resource
            .map(|r| {
                COLUMN_FIELDS
                    .iter()
                    .filter_map(|(short, key)| {
                        r.get_array(key).map(|values| (short.to_string(), values.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let geo_signals = GeoSignals::from_resource(resource);
        let is_geospatial = geo_signals.is_geospatial();
        let download_format = DownloadFormat::resolve(
            reference.download_format_override.as_deref(),
            is_geospatial,
        )?;
        let download_url = domain
            .as_deref()
            .map(|d| build_download_url(d, &reference.id, download_format, is_geospatial));

        let source_last_modified = resource.and_then(|r| r.get_timestamp("data_updated_at"));
        let metadata_last_modified = resource.and_then(|r| r.get_timestamp("metadata_updated_at"));

        Ok(Self {
            dataset_id: reference.id.clone(),
            resource_block,
            display_name,
            domain,
            column_descriptors,
            geo_signals,
            is_geospatial,
            download_format,
            download_url,
            source_last_modified,
            metadata_last_modified,
            checked_at: truncate_to_seconds(checked_at),
        })
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    pub fn resource_block(&self) -> Option<&AttributeMap> {
        self.resource_block.as_ref()
    }

    /// Raw resource attribute lookup; absent block or key reads as `None`.
    pub fn resource_attr(&self, key: &str) -> Option<&JsonValue> {
        self.resource_block.as_ref().and_then(|r| r.get(key))
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn column_descriptors(&self) -> &BTreeMap<String, Vec<JsonValue>> {
        &self.column_descriptors
    }

    pub fn geo_signals(&self) -> GeoSignals {
        self.geo_signals
    }

    pub fn is_geospatial(&self) -> bool {
        self.is_geospatial
    }

    pub fn download_format(&self) -> DownloadFormat {
        self.download_format
    }

    pub fn download_url(&self) -> Option<&str> {
        self.download_url.as_deref()
    }

    pub fn source_last_modified(&self) -> Option<DateTime<Utc>> {
        self.source_last_modified
    }

    pub fn metadata_last_modified(&self) -> Option<DateTime<Utc>> {
        self.metadata_last_modified
    }

    pub fn checked_at(&self) -> DateTime<Utc> {
        self.checked_at
    }
}

#[derive(Debug, Clone)]
pub struct MetadataResolver {
    http: HttpFetcher,
    catalog_url: String,
}

impl MetadataResolver {
    pub fn new(http: HttpFetcher, catalog_url: impl Into<String>) -> Self {
        Self {
            http,
            catalog_url: catalog_url.into(),
        }
    }

    pub fn catalog_query_url(&self, dataset_id: &str) -> String {
        format!(
            "{}/api/catalog/v1?ids={dataset_id}",
            self.catalog_url.trim_end_matches('/')
        )
    }

    pub async fn resolve(&self, reference: &DatasetReference) -> Result<DatasetMetadata, CatalogError> {
        let span = info_span!("catalog_fetch", dataset_id = %reference.id);
        self.fetch_and_derive(reference).instrument(span).await
    }

    async fn fetch_and_derive(
        &self,
        reference: &DatasetReference,
    ) -> Result<DatasetMetadata, CatalogError> {
        let url = self.catalog_query_url(&reference.id);
        let response = self.http.get_json(&url).await?;
        if !response.status.is_success() {
            return Err(CatalogError::MetadataFetch {
                dataset_id: reference.id.clone(),
                status: response.status.as_u16(),
            });
        }
        let checked_at = Utc::now();

        let record = response
            .body
            .get("results")
            .and_then(|results| results.get(0))
            .ok_or_else(|| CatalogError::DatasetNotFound {
                dataset_id: reference.id.clone(),
            })?;

        let metadata = DatasetMetadata::from_catalog_record(reference, record, checked_at)?;
        debug!(
            display_name = metadata.display_name(),
            geospatial = metadata.is_geospatial(),
            format = %metadata.download_format(),
            "resolved catalog metadata"
        );
        Ok(metadata)
    }
}
