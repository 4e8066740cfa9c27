//! Core domain model for ODS: dataset references, download formats and freshness records.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "ods-core";

/// Whole-second UTC rendering used for every persisted or compared timestamp.
pub const UTC_SECONDS_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Caller-supplied identity of a catalog dataset plus optional overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetReference {
    pub id: String,
    pub display_name: Option<String>,
    pub download_format_override: Option<String>,
}

impl DatasetReference {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            download_format_override: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_download_format(mut self, format: impl Into<String>) -> Self {
        self.download_format_override = Some(format.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormatGroup {
    Flat,
    Gis,
}

impl FormatGroup {
    pub const ALL: [FormatGroup; 2] = [FormatGroup::Flat, FormatGroup::Gis];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flat => "flat",
            Self::Gis => "gis",
        }
    }
}

/// Export format understood by the catalog's download endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownloadFormat {
    #[serde(rename = "csv")]
    Csv,
    #[serde(rename = "tsv")]
    Tsv,
    Shapefile,
    #[serde(rename = "GeoJSON")]
    GeoJson,
    #[serde(rename = "KMZ")]
    Kmz,
    #[serde(rename = "KML")]
    Kml,
}

/// Lowercased tokens accepted as overrides, mapped to their canonical format.
const FORMAT_TOKENS: &[(&str, DownloadFormat)] = &[
    ("csv", DownloadFormat::Csv),
    ("tsv", DownloadFormat::Tsv),
    ("shp", DownloadFormat::Shapefile),
    ("shapefile", DownloadFormat::Shapefile),
    ("geojson", DownloadFormat::GeoJson),
    ("kmz", DownloadFormat::Kmz),
    ("kml", DownloadFormat::Kml),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "download format '{requested}' isn't supported; pick from {}",
    describe_choices(&DownloadFormat::valid_choices())
)]
pub struct UnsupportedFormatError {
    pub requested: String,
    pub valid: Vec<String>,
}

impl DownloadFormat {
    /// Default format chosen when the caller supplies no override.
    pub fn default_for(is_geospatial: bool) -> Self {
        if is_geospatial {
            Self::GeoJson
        } else {
            Self::Csv
        }
    }

    /// Validate a caller override case-insensitively and collapse aliases to the canonical token.
    pub fn resolve_override(requested: &str) -> Result<Self, UnsupportedFormatError> {
        let lowered = requested.trim().to_lowercase();
        FORMAT_TOKENS
            .iter()
            .find(|(token, _)| *token == lowered)
            .map(|(_, format)| *format)
            .ok_or_else(|| UnsupportedFormatError {
                requested: requested.to_string(),
                valid: Self::valid_tokens(),
            })
    }

    /// Resolve the effective format from an optional override and the geospatial flag.
    pub fn resolve(
        requested: Option<&str>,
        is_geospatial: bool,
    ) -> Result<Self, UnsupportedFormatError> {
        match requested {
            Some(requested) => Self::resolve_override(requested),
            None => Ok(Self::default_for(is_geospatial)),
        }
    }

    /// Accepted tokens (aliases and canonical spellings) per format group.
    pub fn valid_choices() -> Vec<(FormatGroup, Vec<String>)> {
        FormatGroup::ALL
            .iter()
            .map(|group| {
                let mut tokens: Vec<String> = Vec::new();
                for (token, format) in FORMAT_TOKENS.iter().filter(|(_, f)| f.group() == *group) {
                    for candidate in [*token, format.as_str()] {
                        if !tokens.iter().any(|t| t == candidate) {
                            tokens.push(candidate.to_string());
                        }
                    }
                }
                (*group, tokens)
            })
            .collect()
    }

    pub fn valid_tokens() -> Vec<String> {
        Self::valid_choices()
            .into_iter()
            .flat_map(|(_, tokens)| tokens)
            .collect()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Tsv => "tsv",
            Self::Shapefile => "Shapefile",
            Self::GeoJson => "GeoJSON",
            Self::Kmz => "KMZ",
            Self::Kml => "KML",
        }
    }

    pub fn group(&self) -> FormatGroup {
        match self {
            Self::Csv | Self::Tsv => FormatGroup::Flat,
            Self::Shapefile | Self::GeoJson | Self::Kmz | Self::Kml => FormatGroup::Gis,
        }
    }
}

fn describe_choices(choices: &[(FormatGroup, Vec<String>)]) -> String {
    choices
        .iter()
        .map(|(group, tokens)| format!("{}: {}", group.as_str(), tokens.join(", ")))
        .collect::<Vec<_>>()
        .join("; ")
}

impl fmt::Display for DownloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lowercase, split on whitespace, strip non-alphanumerics per token and join with `_`.
pub fn normalize_identifier(input: &str) -> String {
    input
        .to_lowercase()
        .split_whitespace()
        .map(|token| {
            token
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
        })
        .filter(|token| !token.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

pub fn truncate_to_seconds(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(0)
}

/// Parse a catalog timestamp (`2024-06-01T12:30:45.123Z` or without fraction) to whole-second UTC.
pub fn parse_catalog_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(truncate_to_seconds(ts.with_timezone(&Utc)));
    }
    NaiveDateTime::parse_from_str(raw.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| truncate_to_seconds(naive.and_utc()))
}

pub fn format_utc_seconds(ts: DateTime<Utc>) -> String {
    ts.format(UTC_SECONDS_FORMAT).to_string()
}

/// One append-only audit row describing a freshness decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessRecord {
    pub dataset_id: String,
    pub dataset_name: String,
    pub source_last_modified: DateTime<Utc>,
    pub was_refreshed: bool,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Source timestamp equals the last refreshed one.
    UpToDate { recorded: DateTime<Utc> },
    /// Source reports an older timestamp than the last refresh.
    SourceOlder {
        incoming: DateTime<Utc>,
        recorded: DateTime<Utc>,
    },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpToDate { recorded } => write!(
                f,
                "local copy is as fresh as the source (last modified {})",
                format_utc_seconds(*recorded)
            ),
            Self::SourceOlder { incoming, recorded } => write!(
                f,
                "source last modified {} predates the last refresh at {}",
                format_utc_seconds(*incoming),
                format_utc_seconds(*recorded)
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefreshOutcome {
    Refreshed(PathBuf),
    Skipped(SkipReason),
}

impl RefreshOutcome {
    pub fn is_refreshed(&self) -> bool {
        matches!(self, Self::Refreshed(_))
    }
}
