//! kgrag CLI
//!
//! Insert documents into an incremental knowledge graph and query it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kgrag_agents::{
    CompletionModel, EmbeddingModel, GraphRag, GraphRagConfig, QueryMode, QueryParam, TeiClient,
    TgiClient,
};
use kgrag_db::{init_memory, init_persistent, GraphStore, Workspace};
use std::io::{self, BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// kgrag - incremental GraphRAG over your documents
#[derive(Parser)]
#[command(name = "kgrag")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Working directory (defaults to ~/.kgrag)
    #[arg(short, long)]
    working_dir: Option<PathBuf>,

    /// Storage backend for the working directory
    #[arg(long, value_enum, default_value_t = Backend::Json)]
    backend: Backend,

    /// Keep everything in memory (for testing)
    #[arg(long)]
    memory: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// JSON files, one per store
    Json,
    /// Embedded SurrealDB on RocksDB
    Surreal,
}

#[derive(Subcommand)]
enum Commands {
    /// Insert documents (reads stdin if neither files nor --text are given)
    Insert {
        /// Files to insert, one document each; `-` reads stdin
        paths: Vec<PathBuf>,

        /// Insert this text as a document
        #[arg(short, long)]
        text: Option<String>,
    },

    /// Ask a question
    Query {
        query: String,

        /// Retrieval mode: local, global or naive
        #[arg(short, long, default_value = "global")]
        mode: QueryMode,

        /// Print the assembled context instead of an answer
        #[arg(long)]
        only_context: bool,

        /// Entities (local) or chunks (naive) to retrieve
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Deepest community level to consult
        #[arg(short, long)]
        level: Option<usize>,

        /// Most communities a global query consults
        #[arg(long)]
        max_communities: Option<usize>,

        /// Token budget for the assembled context
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Desired answer format
        #[arg(short, long)]
        response_type: Option<String>,
    },

    /// Show workspace statistics
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// List communities and their report titles
    Communities {
        /// Only this level
        #[arg(short, long)]
        level: Option<usize>,
    },

    /// Interactive mode
    Interactive,

    /// Show the embedding dimension from the active embeddings provider
    EmbeddingDim {
        /// Optional text to embed (defaults to "dimension probe")
        text: Option<String>,
    },

    /// Delete the working directory (fresh start)
    Reset,
}

fn default_working_dir() -> Result<PathBuf> {
    let mut path = dirs::home_dir().context("Could not find home directory")?;
    path.push(".kgrag");
    Ok(path)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let tei = TeiClient::from_env();

    if let Commands::EmbeddingDim { text } = &cli.command {
        ensure_service("embeddings", tei.base_url(), tei.health().await.unwrap_or(false))?;
        let probe = text.clone().unwrap_or_else(|| "dimension probe".to_string());
        let vectors = tei.embed(&[probe]).await?;
        let dimension = vectors.first().map(Vec::len).unwrap_or(0);
        println!("Embedding dimension: {}", dimension);
        return Ok(());
    }

    let working_dir = match cli.working_dir.clone() {
        Some(dir) => dir,
        None => default_working_dir()?,
    };

    if let Commands::Reset = cli.command {
        if working_dir.exists() {
            std::fs::remove_dir_all(&working_dir).with_context(|| {
                format!("Failed to remove working dir at {}", working_dir.display())
            })?;
            println!("✓ Removed working directory at {}", working_dir.display());
        } else {
            println!(
                "Working directory not found at {}, nothing to remove",
                working_dir.display()
            );
        }
        return Ok(());
    }

    let workspace = open_workspace(&cli, &working_dir).await?;
    let best = TgiClient::from_env("TGI_MODEL");
    let cheap = TgiClient::from_env("TGI_CHEAP_MODEL");

    // Check inference services only when needed
    let needs_models = matches!(
        cli.command,
        Commands::Insert { .. } | Commands::Query { .. } | Commands::Interactive
    );
    if needs_models {
        ensure_service("embeddings", tei.base_url(), tei.health().await.unwrap_or(false))?;
        ensure_service("generation", best.base_url(), best.health().await.unwrap_or(false))?;
    }

    let config = GraphRagConfig::from_env();
    let rag = GraphRag::new(
        config,
        workspace,
        Arc::new(best) as Arc<dyn CompletionModel>,
        Arc::new(cheap) as Arc<dyn CompletionModel>,
        Arc::new(tei) as Arc<dyn EmbeddingModel>,
    )?;

    match cli.command {
        Commands::Insert { paths, text } => cmd_insert(&rag, paths, text).await?,
        Commands::Query {
            query,
            mode,
            only_context,
            top_k,
            level,
            max_communities,
            max_tokens,
            response_type,
        } => {
            let mut param = QueryParam::new(mode);
            if only_context {
                param = param.only_context();
            }
            if let Some(top_k) = top_k {
                param = param.with_top_k(top_k);
            }
            if let Some(level) = level {
                param.level = level;
            }
            if let Some(max) = max_communities {
                param = param.with_max_consider_community(max);
            }
            if let Some(max) = max_tokens {
                param = param.with_max_context_tokens(max);
            }
            if let Some(response_type) = response_type {
                param.response_type = response_type;
            }
            cmd_query(&rag, &query, &param).await?;
        }
        Commands::Stats { json } => cmd_stats(&rag, json).await?,
        Commands::Communities { level } => cmd_communities(&rag, level).await?,
        Commands::Interactive => cmd_interactive(&rag).await?,
        Commands::EmbeddingDim { .. } | Commands::Reset => {
            // Handled before the workspace is opened.
        }
    }

    Ok(())
}

fn ensure_service(label: &str, url: &str, healthy: bool) -> Result<()> {
    if !healthy {
        eprintln!("Error: {} service is not reachable.", label);
        eprintln!("  {}: {}", label, url);
        eprintln!("Start it with: docker compose up -d");
        anyhow::bail!("{} service unavailable", label);
    }
    Ok(())
}

async fn open_workspace(cli: &Cli, working_dir: &Path) -> Result<Workspace> {
    match (cli.backend, cli.memory) {
        (Backend::Json, true) => {
            info!("Using in-memory workspace");
            Ok(Workspace::open_memory())
        }
        (Backend::Surreal, true) => {
            info!("Using in-memory SurrealDB workspace");
            Ok(Workspace::open_surreal(init_memory().await?))
        }
        (Backend::Json, false) => {
            info!("Using workspace at: {}", working_dir.display());
            Ok(Workspace::open_json(working_dir).await?)
        }
        (Backend::Surreal, false) => {
            std::fs::create_dir_all(working_dir)?;
            let db_path = working_dir.join("surreal");
            info!("Using SurrealDB at: {}", db_path.display());
            Ok(Workspace::open_surreal(init_persistent(&db_path).await?))
        }
    }
}

async fn cmd_insert(rag: &GraphRag, paths: Vec<PathBuf>, text: Option<String>) -> Result<()> {
    let mut documents = Vec::new();
    for path in &paths {
        if path.as_os_str() == "-" {
            documents.push(read_stdin()?);
            continue;
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read file: {}", path.display()))?;
        documents.push(content);
    }
    if let Some(text) = text {
        documents.push(text);
    }
    if documents.is_empty() {
        eprintln!("Enter document content (Ctrl+D to finish):");
        documents.push(read_stdin()?);
    }
    if documents.iter().all(|d| d.trim().is_empty()) {
        anyhow::bail!("Document content cannot be empty");
    }

    let report = rag.insert(&documents).await?;

    println!("✓ Insert complete:");
    println!("  • New documents: {}", report.new_documents);
    println!("  • New chunks: {}", report.new_chunks);
    println!("  • Chunks processed: {}", report.processed_chunks);
    println!("  • Entities merged: {}", report.entities);
    println!("  • Relations merged: {}", report.relations);
    println!("  • Communities: {}", report.communities);
    if report.vectors_deferred > 0 {
        println!("  • Vectors deferred: {}", report.vectors_deferred);
    }
    if !report.failed_chunks.is_empty() {
        println!(
            "  • Chunks failed: {} (retried on next insert)",
            report.failed_chunks.len()
        );
        for id in &report.failed_chunks {
            println!("    - {}", id);
        }
    }
    Ok(())
}

fn read_stdin() -> Result<String> {
    let mut content = String::new();
    io::stdin()
        .read_to_string(&mut content)
        .context("Failed to read stdin")?;
    Ok(content)
}

async fn cmd_query(rag: &GraphRag, query: &str, param: &QueryParam) -> Result<()> {
    let answer = rag.query(query, param).await?;
    println!("{}", answer.text);
    Ok(())
}

async fn cmd_stats(rag: &GraphRag, json: bool) -> Result<()> {
    let stats = rag.stats().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Workspace Statistics:");
    println!("  • Documents: {}", stats.documents);
    println!("  • Chunks: {}", stats.chunks);
    println!("  • Entities: {}", stats.entities);
    println!("  • Relations: {}", stats.relations);
    println!("  • Communities: {}", stats.communities);
    println!("  • Entity vectors: {}", stats.entity_vectors);
    println!("  • Chunk vectors: {}", stats.chunk_vectors);
    println!("  • Cached responses: {}", stats.cached_responses);
    println!("  • Vector backlog: {}", stats.vector_backlog);

    Ok(())
}

async fn cmd_communities(rag: &GraphRag, level: Option<usize>) -> Result<()> {
    let mut communities = rag.workspace().graph.communities().await?;
    communities.retain(|c| level.map_or(true, |l| c.level == l));

    if communities.is_empty() {
        println!("No communities yet. Insert documents with: kgrag insert <file>");
        return Ok(());
    }

    communities.sort_by(|a, b| {
        a.level
            .cmp(&b.level)
            .then_with(|| b.rank.total_cmp(&a.rank))
            .then_with(|| a.id.cmp(&b.id))
    });
    println!("Communities ({}):\n", communities.len());
    for community in communities {
        println!(
            "• [L{}] {} ({} entities, rating {:.1})",
            community.level,
            community.title,
            community.nodes.len(),
            community.rating()
        );
    }
    Ok(())
}

async fn cmd_interactive(rag: &GraphRag) -> Result<()> {
    println!("kgrag - Interactive Mode");
    println!("Commands: insert, local, global, naive, stats, help, quit");
    println!();

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("kgrag> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break; // EOF
        }

        let parts: Vec<&str> = line.trim().splitn(2, ' ').collect();
        let cmd = parts.first().copied().unwrap_or("");
        let arg = parts.get(1).copied().unwrap_or("");

        match cmd {
            "" => continue,

            "insert" | "i" => {
                if arg.is_empty() {
                    println!("Usage: insert <text>");
                    continue;
                }
                match rag.insert([arg]).await {
                    Ok(report) => println!(
                        "✓ {} chunks processed, {} failed",
                        report.processed_chunks,
                        report.failed_chunks.len()
                    ),
                    Err(e) => println!("Error: {}", e),
                }
            }

            "local" | "global" | "naive" => {
                if arg.is_empty() {
                    println!("Usage: {} <question>", cmd);
                    continue;
                }
                let param = match cmd.parse::<QueryMode>() {
                    Ok(mode) => QueryParam::new(mode),
                    Err(e) => {
                        println!("Error: {}", e);
                        continue;
                    }
                };
                match rag.query(arg, &param).await {
                    Ok(answer) => println!("{}", answer.text),
                    Err(e) => println!("Error: {}", e),
                }
            }

            "stats" => match rag.stats().await {
                Ok(s) => println!(
                    "Documents: {}, Entities: {}, Relations: {}, Communities: {}",
                    s.documents, s.entities, s.relations, s.communities
                ),
                Err(e) => println!("Error: {}", e),
            },

            "help" | "h" | "?" => {
                println!("Commands:");
                println!("  insert <text>      - Insert a document");
                println!("  local <question>   - Entity-centred answer");
                println!("  global <question>  - Answer from community reports");
                println!("  naive <question>   - Answer from similar chunks");
                println!("  stats              - Show statistics");
                println!("  quit               - Exit");
            }

            "quit" | "q" | "exit" => {
                println!("Goodbye!");
                break;
            }

            _ => {
                println!(
                    "Unknown command: {}. Type 'help' for available commands.",
                    cmd
                );
            }
        }

        println!();
    }

    Ok(())
}
