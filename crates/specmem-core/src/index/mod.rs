//! Codebase indexing
//!
//! Walks a project, extracts definitions with per-language patterns, and
//! persists files and definitions with their embeddings into a per-project
//! SQLite schema.
//!
//! - `scanner` - directory walk with exclusions
//! - `language` - extension and file-name detection
//! - `extractor` - regex definition extraction
//! - `store` - SQLite persistence
//! - `coordinator` - the batched pipeline tying it together

pub mod cancellation;
pub mod coordinator;
pub mod extractor;
pub mod language;
pub mod pool;
pub mod scanner;
pub mod stats;
pub mod store;

pub use coordinator::IndexCoordinator;
pub use extractor::{Definition, DefinitionKind};
pub use language::Language;
pub use scanner::{FileScanner, ScannedFile};
pub use stats::{IndexMode, IndexSummary};
pub use store::{IndexStore, ProjectSchema, ProjectStats, StoreError};
