//! # Filesense daemon (`filesense`)
//!
//! Entry point for the file-analysis platform core. Provides commands for
//! database initialization, the HTTP API server, the background worker
//! pool, and one-off reprocessing of a single file.
//!
//! ## Usage
//!
//! ```bash
//! filesense --config ./config/filesense.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `filesense init` | Create the SQLite database and run schema migrations |
//! | `filesense serve` | Start the HTTP API server (and worker unless `--no-worker`) |
//! | `filesense worker` | Run only the background worker pool |
//! | `filesense process <file-id> --user <user-id>` | Enqueue one file for (re)analysis |

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use filesense::analyzer::Analyzer;
use filesense::chat::ChatService;
use filesense::chunk::Chunker;
use filesense::config::{load_config, Config};
use filesense::db;
use filesense::embedding::{create_embedder, Embedder};
use filesense::genai::{GenerativeModel, HttpModel};
use filesense::migrate;
use filesense::pipeline::Pipeline;
use filesense::queue::{JobQueue, ProcessJob, SqliteQueue};
use filesense::retriever::Retriever;
use filesense::server::{run_server, AppState};
use filesense::storage::LocalStorage;
use filesense::store::{SqliteStore, Store};
use filesense::worker::Worker;

/// Filesense — multi-tenant file analysis and retrieval-augmented chat.
#[derive(Parser)]
#[command(
    name = "filesense",
    about = "Filesense — multi-tenant file analysis and retrieval-augmented chat core",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/filesense.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Start the HTTP API server alongside the worker pool.
    Serve {
        /// Run the API without the in-process worker pool.
        #[arg(long)]
        no_worker: bool,
    },

    /// Run only the background worker pool.
    Worker,

    /// Enqueue a file for (re)analysis.
    Process {
        /// File id to process.
        file_id: Uuid,

        /// Owning user id.
        #[arg(long)]
        user: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&config).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("database initialized at {}", config.db.path.display());
            Ok(())
        }
        Commands::Serve { no_worker } => {
            let deps = Deps::build(&config).await?;

            let shutdown = CancellationToken::new();
            let worker_handle = if no_worker {
                None
            } else {
                let worker = deps.worker(&config);
                let token = shutdown.clone();
                Some(tokio::spawn(async move { worker.run(token).await }))
            };

            let state = deps.app_state(&config);
            let result = run_server(state).await;

            shutdown.cancel();
            if let Some(handle) = worker_handle {
                let _ = handle.await;
            }
            result
        }
        Commands::Worker => {
            let deps = Deps::build(&config).await?;
            let worker = deps.worker(&config);

            let shutdown = CancellationToken::new();
            let token = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown requested");
                    token.cancel();
                }
            });

            worker.run(shutdown).await;
            Ok(())
        }
        Commands::Process { file_id, user } => {
            let deps = Deps::build(&config).await?;
            let job_id = deps
                .queue
                .enqueue(&ProcessJob {
                    file_id,
                    user_id: user,
                })
                .await?;
            println!("enqueued job {job_id} for file {file_id}");
            Ok(())
        }
    }
}

/// Wired dependencies shared by the server and worker commands.
struct Deps {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    pipeline: Arc<Pipeline>,
    retriever: Arc<Retriever>,
    chat: Arc<ChatService>,
}

impl Deps {
    async fn build(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;

        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool.clone()));
        let queue: Arc<dyn JobQueue> = Arc::new(SqliteQueue::new(
            pool,
            config.worker.max_attempts,
            config.worker.backoff_base_secs,
        ));
        let storage = Arc::new(LocalStorage::new(config.storage.root.clone()));

        let embedder: Arc<dyn Embedder> = Arc::from(create_embedder(&config.embedding)?);
        let analysis_model: Arc<dyn GenerativeModel> = Arc::new(HttpModel::new(
            config.analysis.base_url.clone(),
            config.analysis.timeout_secs,
            config.analysis.max_retries,
        )?);
        let chat_model: Arc<dyn GenerativeModel> = Arc::new(HttpModel::new(
            config.chat.base_url.clone(),
            config.chat.timeout_secs,
            1,
        )?);

        let chunker = Chunker::new(config.chunking.size, config.chunking.overlap)?;
        let analyzer = Analyzer::new(config.analysis.clone());

        let pipeline = Arc::new(Pipeline::new(
            store.clone(),
            storage,
            embedder.clone(),
            analysis_model,
            analyzer,
            chunker,
        ));

        let retriever = Arc::new(Retriever::new(embedder, store.clone()));
        let chat = Arc::new(ChatService::new(
            retriever.clone(),
            chat_model,
            config.chat.clone(),
        ));

        Ok(Self {
            store,
            queue,
            pipeline,
            retriever,
            chat,
        })
    }

    fn worker(&self, config: &Config) -> Worker {
        Worker::new(
            self.queue.clone(),
            self.store.clone(),
            self.pipeline.clone(),
            config.worker.clone(),
        )
    }

    fn app_state(&self, config: &Config) -> AppState {
        AppState {
            config: Arc::new(config.clone()),
            store: self.store.clone(),
            queue: self.queue.clone(),
            retriever: self.retriever.clone(),
            chat: self.chat.clone(),
        }
    }
}
