use crate::index::store::StoreError;

/// Errors that abort an indexing run.
///
/// Embedding failures never show up here: they are counted in the summary
/// and the affected rows are persisted without an embedding.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Indexing run was cancelled")]
    Cancelled,
}
