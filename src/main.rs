//! # DocQuery CLI (`docq`)
//!
//! The `docq` binary drives the engine from the command line and starts the
//! HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! docq --config ./config/docquery.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docq init` | Create the SQLite database and run schema migrations |
//! | `docq ingest <document-id>` | Run the ingestion pipeline for a registered document |
//! | `docq ask "<question>"` | Answer a question against a document or a project |
//! | `docq history <project-id>` | Print a project's chat history |
//! | `docq serve` | Start the JSON HTTP server |

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use docquery::engine::{Engine, QueryRequest};
use docquery::ingest::Ingestor;
use docquery::openai::OpenAiClient;
use docquery::storage::StorageClient;
use docquery::tabular::TabularClient;
use docquery::{config, db, migrate, server};

/// DocQuery — a document question-answering engine.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docquery.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docq",
    about = "DocQuery — routes questions over uploaded documents to deterministic tabular \
    computation, retrieval synthesis, or a durable provider thread",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docquery.toml")]
    config: PathBuf,

    /// Principal to act as. Maps to the bearer token of the HTTP API.
    #[arg(long, global = true, default_value = "local")]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Idempotent.
    Init,

    /// Run the ingestion pipeline for a registered document.
    ///
    /// Downloads the file from object storage, uploads it to the provider
    /// file store, and either registers a dataframe (tabular files) or
    /// extracts, chunks, and embeds the text.
    Ingest {
        /// Document id to ingest.
        document_id: String,
    },

    /// Answer a question against one document or one project.
    Ask {
        /// The question text.
        question: String,

        /// Scope the question to a single document.
        #[arg(long, conflicts_with = "project")]
        document: Option<String>,

        /// Scope the question to a project (uses the durable thread).
        #[arg(long)]
        project: Option<String>,
    },

    /// Print a project's chat history in chronological order.
    History {
        /// Project id.
        project_id: String,
    },

    /// Start the JSON HTTP server.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("docquery=info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { document_id } => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations_on(&pool).await?;

            let openai = Arc::new(OpenAiClient::new(&cfg.openai)?);
            let tabular = Arc::new(TabularClient::new(&cfg.tabular)?);
            let storage = Arc::new(StorageClient::new(&cfg.storage)?);
            let ingestor = Ingestor::new(pool, cfg.clone(), openai, tabular, storage);

            let report = ingestor.ingest(&document_id, &cli.user, None).await?;
            println!("Ingested {} (file id {})", document_id, report.provider_file_id);
            if report.chunks_written > 0 {
                println!("  {} chunks embedded", report.chunks_written);
            }
            if let Some(rows) = report.row_count {
                println!("  dataframe registered: {} rows", rows);
            }
        }
        Commands::Ask {
            question,
            document,
            project,
        } => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations_on(&pool).await?;

            let openai = Arc::new(OpenAiClient::new(&cfg.openai)?);
            let tabular = Arc::new(TabularClient::new(&cfg.tabular)?);
            let engine = Engine::new(pool, cfg.clone(), openai, tabular);

            let request = QueryRequest {
                question,
                document_id: document,
                project_id: project,
            };
            let response = engine.answer_query(&cli.user, &request).await?;

            println!("{}", response.answer);
            if !response.citations.is_empty() {
                println!();
                for citation in &response.citations {
                    println!(
                        "  [{} #{}] (similarity {:.3})",
                        citation.filename, citation.position, citation.similarity
                    );
                }
            }
        }
        Commands::History { project_id } => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations_on(&pool).await?;

            let openai = Arc::new(OpenAiClient::new(&cfg.openai)?);
            let tabular = Arc::new(TabularClient::new(&cfg.tabular)?);
            let engine = Engine::new(pool, cfg.clone(), openai, tabular);

            let messages = engine.history(&cli.user, &project_id).await?;
            if messages.is_empty() {
                println!("No messages.");
            }
            for message in messages {
                println!("[{}] {}", message.role, message.content);
            }
        }
        Commands::Serve => {
            server::serve(cfg).await?;
        }
    }

    Ok(())
}
