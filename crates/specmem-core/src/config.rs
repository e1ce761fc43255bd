//! Persistent configuration for SpecMem indexing.
//!
//! Looks for `<project>/specmem/config.toml`, then `~/.specmem/config.toml`,
//! and falls back to defaults. A handful of environment variables override
//! whatever the file says.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::IndexError;

/// Directory (relative to the project root) holding sockets, logs and the index
pub const PROJECT_DATA_DIR: &str = "specmem";

/// Socket file name used by every candidate location
pub const SOCKET_FILE_NAME: &str = "embeddings.sock";

/// Top-level SpecMem configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecmemConfig {
    pub embedding: EmbeddingConfig,
    pub index: IndexConfig,
    pub storage: StorageConfig,
}

impl SpecmemConfig {
    /// Load configuration from the given path.
    pub fn load(path: &Path) -> Result<Self, IndexError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| IndexError::Config(e.to_string()))
    }

    /// Save configuration to the given path.
    pub fn save(&self, path: &Path) -> Result<(), IndexError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| IndexError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Resolve the configuration for a project.
    ///
    /// An explicit path must exist; the implicit locations are optional.
    /// Environment overrides are applied last.
    pub fn resolve(project_root: &Path, explicit: Option<&Path>) -> Result<Self, IndexError> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => {
                let project_path = Self::project_path(project_root);
                let user_path = Self::user_path();
                if project_path.exists() {
                    Self::load(&project_path)?
                } else if user_path.exists() {
                    Self::load(&user_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply environment-style overrides from a lookup function.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(socket) = lookup("SPECMEM_EMBEDDING_SOCKET").filter(|s| !s.is_empty()) {
            self.embedding.socket_path = Some(PathBuf::from(socket));
        }
        if let Some(size) = lookup("SPECMEM_MAX_FILE_SIZE").and_then(|s| s.parse().ok()) {
            self.index.max_file_size = size;
        }
        if let Some(n) = lookup("SPECMEM_EMBED_CONCURRENCY").and_then(|s| s.parse().ok()) {
            self.index.max_concurrent_batches = n;
        }
        if let Some(n) = lookup("SPECMEM_MAX_TEXT_CHARS").and_then(|s| s.parse().ok()) {
            self.embedding.max_text_chars = n;
        }
    }

    /// `<project>/specmem/config.toml`
    pub fn project_path(project_root: &Path) -> PathBuf {
        project_root.join(PROJECT_DATA_DIR).join("config.toml")
    }

    /// `~/.specmem/config.toml`
    pub fn user_path() -> PathBuf {
        user_data_dir().join("config.toml")
    }
}

/// `~/.specmem`, or `./.specmem` when no home directory is known
pub fn user_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".specmem")
}

/// Embedding server and client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Explicit socket path; defaults to `<project>/specmem/sockets/embeddings.sock`.
    pub socket_path: Option<PathBuf>,
    /// Program and arguments that start the embedding server.
    pub server_command: Vec<String>,
    /// Start the server when no live socket is found.
    pub auto_spawn: bool,
    /// Maximum characters sent per text.
    pub max_text_chars: usize,
    /// Idle timeout for single requests (reset by heartbeats).
    pub request_timeout_ms: u64,
    /// Idle timeout for batch requests (reset by heartbeats).
    pub batch_timeout_ms: u64,
    /// Hard wall-clock cap for single requests.
    pub hard_timeout_ms: u64,
    /// Hard wall-clock cap for batch requests.
    pub batch_hard_timeout_ms: u64,
    /// Hard wall-clock cap for server-side bulk processing.
    pub bulk_timeout_ms: u64,
    pub max_attempts: u32,
    /// Consecutive failures before the supervisor revalidates the socket.
    pub failure_threshold: u32,
    pub max_heartbeats: usize,
    pub max_batch_heartbeats: usize,
    pub startup_timeout_secs: u64,
    pub probe_timeout_ms: u64,
    pub min_dimension: usize,
    pub max_dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            server_command: Vec::new(),
            auto_spawn: true,
            max_text_chars: 8000,
            request_timeout_ms: 30_000,
            batch_timeout_ms: 120_000,
            hard_timeout_ms: 60_000,
            batch_hard_timeout_ms: 300_000,
            bulk_timeout_ms: 1_800_000,
            max_attempts: 3,
            failure_threshold: 3,
            max_heartbeats: 20,
            max_batch_heartbeats: 30,
            startup_timeout_secs: 300,
            probe_timeout_ms: 2_000,
            min_dimension: 32,
            max_dimension: 4096,
        }
    }
}

impl EmbeddingConfig {
    /// Socket path for a project, honoring the explicit override.
    pub fn socket_path_for(&self, project_root: &Path) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| project_socket_dir(project_root).join(SOCKET_FILE_NAME))
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// `<project>/specmem/sockets`
pub fn project_socket_dir(project_root: &Path) -> PathBuf {
    project_root.join(PROJECT_DATA_DIR).join("sockets")
}

/// Indexing pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub max_depth: usize,
    /// Files larger than this many bytes are skipped.
    pub max_file_size: u64,
    /// Worker count per phase; tiered by file count when unset.
    pub concurrency: Option<usize>,
    pub embed_batch_size: usize,
    pub max_concurrent_batches: usize,
    /// Files processed per pipeline pass.
    pub file_batch_size: usize,
    /// Above this many candidate files the store-then-embed mode is used.
    pub large_codebase_threshold: usize,
    pub max_definitions_per_file: usize,
    pub follow_symlinks: bool,
    /// Glob patterns (relative to the project root) to skip.
    pub exclude_patterns: Vec<String>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_depth: 25,
            max_file_size: 1024 * 1024,
            concurrency: None,
            embed_batch_size: 100,
            max_concurrent_batches: 4,
            file_batch_size: 200,
            large_codebase_threshold: 5000,
            max_definitions_per_file: 500,
            follow_symlinks: false,
            exclude_patterns: Vec::new(),
        }
    }
}

impl IndexConfig {
    /// Worker count for a run over `file_count` files.
    pub fn concurrency_for(&self, file_count: usize) -> usize {
        if let Some(n) = self.concurrency {
            return n.max(1);
        }
        match file_count {
            0..=99 => 4,
            100..=999 => 8,
            1000..=4999 => 16,
            _ => 24,
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the SQLite files; defaults to `<project>/specmem/index`.
    pub data_dir: Option<PathBuf>,
    /// Stored embedding dimension.
    pub dimension: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            dimension: 384,
        }
    }
}

impl StorageConfig {
    pub fn data_dir_for(&self, project_root: &Path) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| project_root.join(PROJECT_DATA_DIR).join("index"))
    }
}
