//! Asynchronous indexing jobs: queue backends, the polling worker and the
//! index-file scheduler.

pub mod memory;
pub mod postgres;
pub mod queue;
pub mod scheduler;
pub mod worker;

pub use memory::InMemoryJobQueue;
pub use postgres::PgJobQueue;
pub use queue::{Job, JobHandler, JobQueue, JobState, SendOptions};
pub use scheduler::{
    index_file_send_options, index_result_to_job_outcome, FileIndexer, IndexFileJobHandler,
    IndexFilePayload, JobScheduler,
};
pub use worker::{work, WorkOptions, WorkerHandle};
