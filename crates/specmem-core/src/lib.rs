//! SpecMem core library
//!
//! Scans a project tree, extracts files and definitions, obtains embeddings
//! from a local embedding server over a Unix socket, and persists everything
//! into a per-project SQLite schema.
//!
//! Key components:
//! - `config` - TOML configuration with environment overrides
//! - `embedding` - socket protocol, client, and server supervision
//! - `index` - scanning, extraction, persistence, and the indexing pipeline

pub mod config;
pub mod embedding;
pub mod error;
pub mod index;

pub use config::SpecmemConfig;
pub use embedding::{EmbeddingBackend, EmbeddingClient, EmbeddingSupervisor};
pub use error::IndexError;
pub use index::{IndexCoordinator, IndexStore, IndexSummary};
