use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use kb_index_core::stores::postgres::{connect, migrate};
use kb_index_core::{
    compute_effective_rag_config, detect_kind, extract_text, split_text, CharacterRagSettings,
    ChunkingConfig, DocumentKind, EmbeddingClient, FileIndexer, FileRepository, FileStorage,
    GlobalConfig, GlobalRagSettings, InMemoryJobQueue, InMemoryKnowledgeStore, IndexMode,
    IndexingOrchestrator, JobQueue, JobScheduler, JobState, KnowledgeBaseService,
    LocalFileStorage, MemoryItemStore, PgJobQueue, PgKnowledgeStore, RagConfigSources,
    RagOverrides, UploadRequest,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;
use walkdir::WalkDir;

#[derive(Parser)]
#[command(name = "kb-index", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Embedding provider: ollama, openai or local.
    #[arg(long, env = "KB_EMBEDDING_PROVIDER", global = true)]
    embedding_provider: Option<String>,

    /// Embedding service base URL.
    #[arg(long, env = "KB_EMBEDDING_URL", global = true)]
    embedding_url: Option<String>,

    /// Embedding model name.
    #[arg(long, env = "KB_EMBEDDING_MODEL", global = true)]
    embedding_model: Option<String>,
}

#[derive(Args)]
struct DatabaseArgs {
    /// Postgres connection string. Without it everything stays in memory.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Directory that receives uploaded file bytes.
    #[arg(long, env = "KB_STORAGE_DIR", default_value = "./kb-storage")]
    storage_dir: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Upload every supported file under a folder and index it.
    Ingest {
        /// Folder scanned recursively for PDF and text-like files.
        #[arg(long)]
        folder: PathBuf,
        /// Owner of the uploaded files. A fresh id is generated when omitted.
        #[arg(long)]
        user_id: Option<Uuid>,
        /// Attach the files to a character instead of the user.
        #[arg(long)]
        character_id: Option<Uuid>,
        /// Tags applied to every uploaded file.
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        /// Index within the upload instead of through the job queue.
        #[arg(long, default_value_t = false)]
        inline: bool,
        #[command(flatten)]
        database: DatabaseArgs,
    },
    /// Extract and chunk one file, printing the chunks as JSON.
    Chunk {
        #[arg(long)]
        file: PathBuf,
    },
    /// Check whether the embedding service answers.
    Probe,
    /// Resolve the effective retrieval settings for one request.
    RagConfig {
        #[arg(long)]
        request_mode: Option<String>,
        #[arg(long)]
        request_enabled: Option<bool>,
        #[arg(long, value_delimiter = ',')]
        request_tags: Option<Vec<String>>,
        #[arg(long)]
        conversation_mode: Option<String>,
        #[arg(long)]
        conversation_enabled: Option<bool>,
        #[arg(long, value_delimiter = ',')]
        conversation_tags: Option<Vec<String>>,
        #[arg(long)]
        character_mode: Option<String>,
    },
    /// Poll the index-file queue until interrupted.
    Worker {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
        #[arg(long, env = "KB_STORAGE_DIR", default_value = "./kb-storage")]
        storage_dir: PathBuf,
    },
}

struct Backends {
    files: Arc<dyn FileRepository>,
    memories: Arc<dyn MemoryItemStore>,
    queue: Arc<dyn JobQueue>,
}

impl Backends {
    async fn open(database_url: Option<&str>) -> anyhow::Result<Self> {
        match database_url {
            Some(url) => {
                let pool = connect(url).await.context("connecting to postgres")?;
                migrate(&pool).await.context("running migrations")?;
                let store = Arc::new(PgKnowledgeStore::new(pool.clone()));
                Ok(Self {
                    files: store.clone(),
                    memories: store,
                    queue: Arc::new(PgJobQueue::new(pool)),
                })
            }
            None => {
                let store = Arc::new(InMemoryKnowledgeStore::new());
                Ok(Self {
                    files: store.clone(),
                    memories: store,
                    queue: Arc::new(InMemoryJobQueue::new()),
                })
            }
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<GlobalConfig> {
    let mut config = GlobalConfig::from_env();
    if let Some(provider) = &cli.embedding_provider {
        config.embedding.provider = provider.parse()?;
    }
    if let Some(url) = &cli.embedding_url {
        config.embedding.base_url = url.clone();
    }
    if let Some(model) = &cli.embedding_model {
        config.embedding.model = model.clone();
    }
    config.validate()?;
    Ok(config)
}

/// MIME type to declare for a local file, judged by its extension.
fn file_type_for(path: &Path) -> Option<&'static str> {
    let file_name = path.file_name()?.to_str()?;
    match detect_kind("", file_name)? {
        DocumentKind::Pdf => Some("application/pdf"),
        DocumentKind::PlainText => Some("text/plain"),
    }
}

fn discover_files(folder: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(folder)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| file_type_for(path).is_some())
        .collect();
    files.sort();
    files
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        provider = ?config.embedding.provider,
        "kb-index boot"
    );

    match cli.command {
        Command::Ingest {
            folder,
            user_id,
            character_id,
            tags,
            inline,
            database,
        } => {
            let paths = discover_files(&folder);
            if paths.is_empty() {
                println!("no supported files under {}", folder.display());
                return Ok(());
            }

            let backends = Backends::open(database.database_url.as_deref()).await?;
            let storage: Arc<dyn FileStorage> =
                Arc::new(LocalFileStorage::new(&database.storage_dir));
            let embeddings = EmbeddingClient::from_config(&config.embedding)?;
            let orchestrator: Arc<dyn FileIndexer> = Arc::new(IndexingOrchestrator::new(
                backends.files.clone(),
                backends.memories.clone(),
                storage.clone(),
                embeddings,
                &config.indexing,
            )?);
            let scheduler = Arc::new(JobScheduler::new(
                backends.queue.clone(),
                config.jobs.clone(),
            ));
            let service = KnowledgeBaseService::new(
                backends.files.clone(),
                backends.memories.clone(),
                storage,
                scheduler.clone(),
                orchestrator.clone(),
                config.indexing.clone(),
            );

            let user_id = user_id.unwrap_or_else(Uuid::new_v4);
            let mode = if inline { IndexMode::Inline } else { IndexMode::Queued };
            info!(folder = %folder.display(), files = paths.len(), %user_id, ?mode, "ingesting folder");

            let mut uploaded = 0usize;
            let mut job_ids = Vec::new();
            for path in paths {
                let Some(file_type) = file_type_for(&path) else {
                    continue;
                };
                let bytes = match tokio::fs::read(&path).await {
                    Ok(bytes) => bytes,
                    Err(error) => {
                        warn!(path = %path.display(), %error, "skipping unreadable file");
                        continue;
                    }
                };
                let file_name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();

                let request = UploadRequest {
                    user_id,
                    character_id,
                    file_name,
                    file_type: file_type.to_string(),
                    bytes,
                    tags: tags.clone(),
                    priority: None,
                };
                match service.upload_file(request, mode).await {
                    Ok(outcome) => {
                        uploaded += 1;
                        job_ids.extend(outcome.job_id);
                        match outcome.index_result {
                            Some(result) => println!(
                                "{} {} chunks={}/{}{}",
                                outcome.file.id,
                                path.display(),
                                result.chunks_created,
                                result.total_chunks,
                                result
                                    .error
                                    .map(|error| format!(" error={error}"))
                                    .unwrap_or_default()
                            ),
                            None => println!(
                                "{} {} queued job={}",
                                outcome.file.id,
                                path.display(),
                                outcome.job_id.map(|id| id.to_string()).unwrap_or_default()
                            ),
                        }
                    }
                    Err(error) => warn!(path = %path.display(), %error, "upload rejected"),
                }
            }

            if !job_ids.is_empty() {
                let worker = scheduler.register_index_file_handler(orchestrator);
                let finished = scheduler
                    .wait_for_jobs(&job_ids, Duration::from_millis(250))
                    .await;
                worker.shutdown().await?;
                for job in finished? {
                    if job.state != JobState::Completed {
                        warn!(
                            job_id = %job.id,
                            state = %job.state,
                            error = job.last_error.as_deref().unwrap_or_default(),
                            "index job did not complete"
                        );
                    }
                }
            }

            let files = service.list_files(user_id, character_id).await?;
            for file in &files {
                println!(
                    "{} status={} {}{}",
                    file.id,
                    file.status,
                    file.file_name,
                    file.last_error
                        .as_deref()
                        .map(|error| format!(" error={error}"))
                        .unwrap_or_default()
                );
            }
            println!(
                "{uploaded} files uploaded at {}",
                Utc::now().to_rfc3339()
            );
        }
        Command::Chunk { file } => {
            let Some(file_type) = file_type_for(&file) else {
                bail!("unsupported file extension: {}", file.display());
            };
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let file_name = file.to_string_lossy();
            let text = extract_text(file_type, &file_name, &bytes)?;
            let chunking =
                ChunkingConfig::new(config.indexing.chunk_size, config.indexing.chunk_overlap)?;
            let chunks = split_text(&text, chunking);
            info!(file = %file.display(), chunk_count = chunks.len(), "chunked file");
            print_json(&chunks)?;
        }
        Command::Probe => {
            let embeddings = EmbeddingClient::from_config(&config.embedding)?;
            let availability = embeddings.check_availability().await;
            print_json(&availability)?;
            if !availability.available {
                bail!("embedding service unavailable");
            }
        }
        Command::RagConfig {
            request_mode,
            request_enabled,
            request_tags,
            conversation_mode,
            conversation_enabled,
            conversation_tags,
            character_mode,
        } => {
            let request = RagOverrides {
                enabled: request_enabled,
                mode: request_mode,
                tag_filters: request_tags,
            };
            let conversation = RagOverrides {
                enabled: conversation_enabled,
                mode: conversation_mode,
                tag_filters: conversation_tags,
            };
            let character = CharacterRagSettings {
                rag_mode: character_mode,
            };
            let global = GlobalRagSettings::from(&config.retrieval);
            let effective = compute_effective_rag_config(&RagConfigSources {
                request: Some(&request),
                conversation: Some(&conversation),
                character: Some(&character),
                global: Some(&global),
            });
            print_json(&effective)?;
        }
        Command::Worker {
            database_url,
            storage_dir,
        } => {
            let backends = Backends::open(Some(&database_url)).await?;
            let storage: Arc<dyn FileStorage> = Arc::new(LocalFileStorage::new(&storage_dir));
            let embeddings = EmbeddingClient::from_config(&config.embedding)?;
            let orchestrator = Arc::new(IndexingOrchestrator::new(
                backends.files,
                backends.memories,
                storage,
                embeddings,
                &config.indexing,
            )?);
            let scheduler = JobScheduler::new(backends.queue, config.jobs.clone());
            let worker = scheduler.register_index_file_handler(orchestrator);
            info!(queue = worker.queue_name(), "worker running, ctrl-c to stop");

            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            info!("shutting down worker");
            worker.shutdown().await?;
        }
    }

    Ok(())
}
