pub mod cancel;
pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod feedback;
pub mod jobs;
pub mod knowledge_base;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod rag_config;
pub mod retrieval;
pub mod stores;
pub mod traits;

pub use cancel::{cancellation, CancellationSignal, CancellationSource};
pub use chunking::{split_text, ChunkingConfig, TextChunk};
pub use config::{
    EmbeddingConfig, EmbeddingProviderKind, GlobalConfig, IndexingConfig, JobConfig,
    RetrievalDefaults,
};
pub use embeddings::{
    EmbeddingAvailability, EmbeddingClient, EmbeddingProvider, GeneratedEmbedding,
    LocalNgramProvider,
};
pub use error::{
    ConfigError, EmbeddingError, ExtractError, FeedbackError, IndexError, JobError, StoreError,
};
pub use extractor::{detect_kind, extract_text, DocumentKind};
pub use feedback::{FeedbackAction, FeedbackCaller, MemoryFeedbackService};
pub use jobs::{
    FileIndexer, InMemoryJobQueue, Job, JobHandler, JobQueue, JobScheduler, JobState,
    PgJobQueue, SendOptions, WorkOptions, WorkerHandle,
};
pub use knowledge_base::{
    IndexMode, KnowledgeBaseService, ReindexOutcome, UploadOutcome, UploadRequest,
};
pub use models::{
    FileStatus, IndexResult, KnowledgeBaseFile, MemoryItem, OwnerType, SourceType,
    VisibilityPolicy,
};
pub use orchestrator::IndexingOrchestrator;
pub use providers::{OllamaProvider, OpenAiCompatibleProvider};
pub use rag_config::{
    compute_effective_rag_config, CharacterRagSettings, EffectiveRagConfig, GlobalRagSettings,
    RagConfigSources, RagMode, RagOverrides,
};
pub use retrieval::{plan_retrieval, select_memories, RankedMemory, RetrievalPlan, ScoredMemory};
pub use stores::{InMemoryKnowledgeStore, LocalFileStorage, PgKnowledgeStore};
pub use traits::{FileRepository, FileStorage, MemoryItemStore, StatusSwap, StatusUpdate};
