use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use clio::{
    config::ManifestLoader,
    context::{AppContextBuilder, CliOverrides},
    indexer::runtime::TracingHandlerRuntime,
    store::MemoryStore,
    supervisor::Supervisor,
};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use url::Url;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs the indexing engine.
    Run {
        /// Path to the node configuration file.
        #[arg(short, long)]
        config: Option<String>,

        /// Heights to buffer per scheduler scan.
        #[arg(long)]
        batch_size: Option<u64>,

        /// Worker count; 0 runs the single-process dispatcher.
        #[arg(long)]
        workers: Option<usize>,

        /// Comma-separated RPC endpoint list, overriding the manifest.
        #[arg(long, value_parser = parse_endpoints)]
        endpoint: Option<Vec<Url>>,

        /// Dictionary service URL, overriding the manifest.
        #[arg(long)]
        dictionary: Option<Url>,

        /// Index against the best (optimistic) head instead of the
        /// finalized head.
        #[arg(long)]
        unfinalized_blocks: bool,

        /// Entity-store cache size.
        #[arg(long)]
        store_cache_size: Option<usize>,

        /// Enables the sandbox profiler.
        #[arg(long)]
        profiler: bool,

        /// Comma-separated heights to skip without processing.
        #[arg(long, value_parser = parse_heights)]
        bypass_blocks: Option<Vec<u64>>,
    },
    /// Validates a project manifest and exits.
    Validate {
        /// Path to the manifest.
        manifest: PathBuf,
    },
}

fn parse_endpoints(raw: &str) -> Result<Vec<Url>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Url::parse(s).map_err(|e| format!("invalid endpoint `{s}`: {e}")))
        .collect()
}

fn parse_heights(raw: &str) -> Result<Vec<u64>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u64>().map_err(|e| format!("invalid height `{s}`: {e}")))
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber =
        FmtSubscriber::builder().with_env_filter(EnvFilter::from_default_env()).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            batch_size,
            workers,
            endpoint,
            dictionary,
            unfinalized_blocks,
            store_cache_size,
            profiler,
            bypass_blocks,
        } => {
            let overrides = CliOverrides {
                batch_size,
                workers,
                endpoints: endpoint,
                dictionary,
                unfinalized_blocks: unfinalized_blocks.then_some(true),
                store_cache_size,
                profiler,
                bypass_blocks,
            };
            run(config, overrides).await?;
        }
        Commands::Validate { manifest } => {
            let manifest = ManifestLoader::new(manifest).load()?;
            tracing::info!(
                project = %manifest.name,
                version = %manifest.version,
                spec_version = %manifest.spec_version,
                datasource_count = manifest.data_sources.len(),
                "Manifest is valid."
            );
        }
    }

    Ok(())
}

async fn run(
    config_path: Option<String>,
    overrides: CliOverrides,
) -> Result<(), Box<dyn std::error::Error>> {
    let context = AppContextBuilder::new(config_path, overrides).build().await?;

    let supervisor = Supervisor::builder()
        .context(context)
        .store(Arc::new(MemoryStore::new()))
        .runtime(Arc::new(TracingHandlerRuntime))
        .build()?;

    tracing::info!("Supervisor initialized, starting indexing...");
    supervisor.run().await?;
    Ok(())
}
