use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration value for {field}: {details}")]
    Invalid { field: &'static str, details: String },
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding service unavailable: {0}")]
    Unavailable(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("embedding provider {provider} rejected the request with {status}: {details}")]
    ClientStatus {
        provider: String,
        status: u16,
        details: String,
    },

    #[error("embedding provider {provider} failed with {status}: {details}")]
    ServerStatus {
        provider: String,
        status: u16,
        details: String,
    },

    #[error("invalid response from {provider}: {details}")]
    MalformedResponse { provider: String, details: String },

    #[error("expected {expected} embedding dimensions, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("embedding cancelled")]
    Cancelled,
}

impl EmbeddingError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            EmbeddingError::Http(_)
            | EmbeddingError::ServerStatus { .. }
            | EmbeddingError::Unavailable(_) => true,
            EmbeddingError::Url(_)
            | EmbeddingError::ClientStatus { .. }
            | EmbeddingError::MalformedResponse { .. }
            | EmbeddingError::DimensionMismatch { .. }
            | EmbeddingError::RetriesExhausted { .. }
            | EmbeddingError::Cancelled => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("knowledge base file not found: {0}")]
    FileNotFound(Uuid),

    #[error("memory item not found: {0}")]
    MemoryItemNotFound(Uuid),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt row: {0}")]
    CorruptRow(String),

    #[error("transaction failed: {0}")]
    Transaction(String),
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported file type: {0}")]
    UnsupportedType(String),

    #[error("pdf parse error: {0}")]
    PdfParse(String),
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job queue error: {0}")]
    Queue(String),

    #[error("invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("job handler failed: {0}")]
    HandlerFailed(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("worker is shut down")]
    ShutDown,

    #[error("job {job_id} attempt {retry_count} is no longer active")]
    StaleAttempt { job_id: Uuid, retry_count: u32 },
}

#[derive(Debug, Error)]
pub enum FeedbackError {
    #[error("memory item not found: {0}")]
    NotFound(Uuid),

    #[error("not allowed to modify memory item {0}")]
    Forbidden(Uuid),

    #[error("unknown feedback action: {0}")]
    UnknownAction(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("file too large: {size} bytes exceeds limit of {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not allowed to access knowledge base file {0}")]
    Forbidden(Uuid),

    #[error("cannot move file {file_id} from {from} to {to}")]
    InvalidTransition {
        file_id: Uuid,
        from: String,
        to: String,
    },
}

pub type Result<T, E = IndexError> = std::result::Result<T, E>;
