use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ods_core::{format_utc_seconds, DatasetReference, RefreshOutcome};
use ods_sync::{SyncConfig, SyncPipeline};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ods")]
#[command(about = "Keep local copies of open-data catalog datasets fresh")]
struct Cli {
    /// Directory holding `data/`, `data/archive/` and `db/` (overrides ODS_PROJECT_ROOT).
    #[arg(long, global = true)]
    project_root: Option<PathBuf>,
    /// Catalog API base URL (overrides ODS_CATALOG_URL).
    #[arg(long, global = true)]
    catalog_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download the dataset if the source changed since the last refresh.
    Refresh(DatasetArgs),
    /// Create the data directories and the audit schema.
    Migrate,
    /// Print the resolved catalog metadata as JSON without touching local state.
    Inspect(DatasetArgs),
    /// List recorded freshness checks, newest first.
    History {
        id: String,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[derive(Debug, Args)]
struct DatasetArgs {
    /// Catalog dataset identifier, e.g. `abcd-1234`.
    id: String,
    /// Local file name to use instead of the normalized catalog name.
    #[arg(long)]
    name: Option<String>,
    /// Download format override (csv, tsv, shp, shapefile, geojson, kmz, kml).
    #[arg(long)]
    format: Option<String>,
}

impl DatasetArgs {
    fn reference(&self) -> DatasetReference {
        let mut reference = DatasetReference::new(&self.id);
        if let Some(name) = &self.name {
            reference = reference.with_display_name(name);
        }
        if let Some(format) = &self.format {
            reference = reference.with_download_format(format);
        }
        reference
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = SyncConfig::from_env();
    if let Some(root) = cli.project_root {
        config.project_root = root;
    }
    if let Some(url) = cli.catalog_url {
        config.catalog_url = url;
    }
    let pipeline = SyncPipeline::new(config).await?;

    match cli.command {
        Commands::Refresh(args) => {
            let summary = pipeline.run_once(&args.reference()).await?;
            match &summary.outcome {
                RefreshOutcome::Refreshed(path) => println!(
                    "refreshed: dataset={} format={} path={}",
                    summary.dataset_id,
                    summary.download_format,
                    path.display()
                ),
                RefreshOutcome::Skipped(reason) => println!(
                    "skipped: dataset={} reason={}",
                    summary.dataset_id, reason
                ),
            }
        }
        Commands::Migrate => {
            pipeline.migrate().await?;
            println!(
                "migrated: root={} audit_db={}",
                pipeline.config().project_root.display(),
                pipeline.config().audit_db_path().display()
            );
        }
        Commands::Inspect(args) => {
            let metadata = pipeline.resolve(&args.reference()).await?;
            let json =
                serde_json::to_string_pretty(&metadata).context("serializing dataset metadata")?;
            println!("{json}");
        }
        Commands::History { id, limit } => {
            let entries = pipeline.history(&id, limit).await?;
            if entries.is_empty() {
                println!("no freshness checks recorded for {id}");
            }
            for entry in entries {
                println!(
                    "#{} {} source_last_modified={} refreshed={} checked_at={}",
                    entry.id,
                    entry.record.dataset_name,
                    format_utc_seconds(entry.record.source_last_modified),
                    entry.record.was_refreshed,
                    format_utc_seconds(entry.record.checked_at)
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn refresh_args_build_reference() {
        let cli = Cli::parse_from([
            "ods",
            "--project-root",
            "/srv/warehouse",
            "refresh",
            "abcd-1234",
            "--name",
            "permits",
            "--format",
            "shp",
        ]);
        assert_eq!(cli.project_root, Some(PathBuf::from("/srv/warehouse")));
        let Commands::Refresh(args) = cli.command else {
            panic!("expected refresh");
        };
        assert_eq!(
            args.reference(),
            DatasetReference::new("abcd-1234")
                .with_display_name("permits")
                .with_download_format("shp")
        );
    }
}
