//! specmem: index a codebase into SpecMem's per-project embedding store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use specmem_core::embedding::{ClientConfig, SupervisorConfig};
use specmem_core::index::store::project_schema_name;
use specmem_core::{
    EmbeddingClient, EmbeddingSupervisor, IndexCoordinator, IndexStore, IndexSummary,
    SpecmemConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "specmem", about = "Codebase indexing for SpecMem")]
#[command(version, propagate_version = true)]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a project
    Index {
        /// Project directory (defaults to current directory)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Configuration file (defaults to specmem/config.toml, then ~/.specmem/config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Worker count per pipeline phase
        #[arg(long)]
        concurrency: Option<usize>,

        /// Never start the embedding server
        #[arg(long)]
        no_spawn: bool,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Query the embedding server's health endpoint
    Health {
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Socket to query instead of the project's
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Make sure an embedding server is listening, starting one if needed
    EnsureServer {
        #[arg(short, long)]
        path: Option<PathBuf>,
    },

    /// Show stored file and definition counts
    Status {
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "specmem=debug,specmem_core=debug"
    } else {
        "specmem=info,specmem_core=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Index {
            path,
            config,
            concurrency,
            no_spawn,
            json,
        } => {
            let root = project_root(path)?;
            let mut cfg = SpecmemConfig::resolve(&root, config.as_deref())
                .context("Failed to load configuration")?;
            if concurrency.is_some() {
                cfg.index.concurrency = concurrency;
            }
            if no_spawn {
                cfg.embedding.auto_spawn = false;
            }
            cmd_index(&root, &cfg, json).await
        }
        Commands::Health { path, socket } => {
            let root = project_root(path)?;
            let mut cfg = SpecmemConfig::resolve(&root, None)?;
            if socket.is_some() {
                cfg.embedding.socket_path = socket;
            }
            cfg.embedding.auto_spawn = false;
            let client = embedding_client(&root, &cfg);
            let health = client
                .health()
                .await
                .context("Embedding server health check failed")?;
            println!("{}", serde_json::to_string_pretty(&health)?);
            Ok(())
        }
        Commands::EnsureServer { path } => {
            let root = project_root(path)?;
            let cfg = SpecmemConfig::resolve(&root, None)?;
            let client = embedding_client(&root, &cfg);
            let socket = client
                .supervisor()
                .ensure_running()
                .await
                .context("Embedding server is not available")?;
            println!("{}", socket.display());
            Ok(())
        }
        Commands::Status { path } => {
            let root = project_root(path)?;
            let cfg = SpecmemConfig::resolve(&root, None)?;
            let store = open_store(&root, &cfg)?;
            let schema = store.ensure_schema(&root).await?;
            store.ensure_tables(&schema).await?;
            let stats = store
                .project_stats(&schema, &root.to_string_lossy())
                .await?;
            println!("Schema:      {}", schema.name);
            println!("Database:    {}", schema.db_path.display());
            println!("Files:       {} ({} embedded)", stats.files, stats.files_embedded);
            println!(
                "Definitions: {} ({} embedded)",
                stats.definitions, stats.definitions_embedded
            );
            Ok(())
        }
    }
}

async fn cmd_index(root: &Path, cfg: &SpecmemConfig, json: bool) -> Result<()> {
    let store = Arc::new(open_store(root, cfg)?);
    let client = Arc::new(embedding_client(root, cfg));
    let coordinator = IndexCoordinator::new(root, cfg, store, client);

    let summary = coordinator
        .run()
        .await
        .with_context(|| format!("Indexing {} failed", root.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn project_root(path: Option<PathBuf>) -> Result<PathBuf> {
    let path = match path {
        Some(p) => p,
        None => std::env::current_dir().context("Cannot determine current directory")?,
    };
    path.canonicalize()
        .with_context(|| format!("Project directory {} not found", path.display()))
}

fn open_store(root: &Path, cfg: &SpecmemConfig) -> Result<IndexStore> {
    let data_dir = cfg.storage.data_dir_for(root);
    IndexStore::open(&data_dir, cfg.storage.dimension)
        .with_context(|| format!("Failed to open index store at {}", data_dir.display()))
}

fn embedding_client(root: &Path, cfg: &SpecmemConfig) -> EmbeddingClient {
    let supervisor = SupervisorConfig::new(root, &cfg.embedding, &project_schema_name(root));
    EmbeddingClient::new(
        Arc::new(EmbeddingSupervisor::new(supervisor)),
        ClientConfig::from(&cfg.embedding),
    )
}

fn print_summary(summary: &IndexSummary) {
    println!("Indexed into schema {} ({:?})", summary.schema, summary.mode);
    println!(
        "Files:       {} scanned, {} indexed, {} unchanged, {} removed, {} failed",
        summary.files_scanned,
        summary.files_indexed,
        summary.files_skipped,
        summary.files_removed,
        summary.files_failed
    );
    let excluded = &summary.excluded;
    println!(
        "Excluded:    {} binary, {} empty, {} oversized, {} unreadable",
        excluded.binary, excluded.empty, excluded.oversized, excluded.unreadable
    );
    println!(
        "Definitions: {} extracted ({} files hit the limit)",
        summary.definitions_extracted, summary.files_truncated
    );
    if summary.embeddings_enabled {
        println!(
            "Embeddings:  {} generated, {} failed",
            summary.embeddings_generated, summary.embeddings_failed
        );
    } else {
        println!(
            "Embeddings:  server unavailable, {} rows stored without embeddings",
            summary.embeddings_skipped
        );
    }
    for (kind, count) in &summary.errors {
        println!("  {kind}: {count}");
    }
    println!("Elapsed:     {} ms", summary.elapsed_ms);
}
