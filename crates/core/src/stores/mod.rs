pub mod local_fs;
pub mod memory;
pub mod postgres;

pub use local_fs::LocalFileStorage;
pub use memory::InMemoryKnowledgeStore;
pub use postgres::PgKnowledgeStore;
