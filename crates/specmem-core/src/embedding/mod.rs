//! Embedding server access
//!
//! - `protocol` - request and frame types for the socket protocol
//! - `transport` - newline-framed Unix socket connection
//! - `client` - single/batch/bulk requests with heartbeats, timeouts and retries
//! - `supervisor` - spawns, probes, and respawns the embedding server
//! - `retry` - client retry delays and respawn backoff
//! - `error` - failure taxonomy

pub mod client;
pub mod error;
pub mod protocol;
pub mod retry;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
pub(crate) mod fake_server;

use async_trait::async_trait;

pub use client::{ClientConfig, EmbeddingClient};
pub use error::{EmbeddingError, EmbeddingErrorKind};
pub use protocol::{BulkOutcome, BulkRequest, BulkTarget};
pub use supervisor::{EmbeddingSupervisor, SupervisorConfig, SupervisorError};

/// Source of embeddings for the indexing pipeline.
///
/// `EmbeddingClient` is the production implementation; the seam exists so
/// pipeline behavior can be exercised without a socket.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Make sure the server is reachable before a run starts
    async fn ensure_ready(&self) -> Result<(), EmbeddingError>;

    /// Embed one text; `None` for empty input or an unusable vector
    async fn embed_one(&self, text: &str) -> Result<Option<Vec<f32>>, EmbeddingError>;

    /// Embed many texts; the result always has `texts.len()` entries
    async fn embed_batch(&self, texts: &[String])
        -> Result<Vec<Option<Vec<f32>>>, EmbeddingError>;

    /// Ask the server to embed and store everything still missing
    async fn process_bulk(&self, request: BulkRequest) -> Result<BulkOutcome, EmbeddingError>;
}
