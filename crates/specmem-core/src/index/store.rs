//! Per-project persistence for files and definitions
//!
//! Each project schema is its own SQLite file, attached to a shared
//! connection under the schema name. The connection lives behind a mutex and
//! every call runs on the blocking pool.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use super::extractor::{definition_text, Definition};

pub const DEFAULT_SCHEMA: &str = "specmem_default";

/// Environment variable that pins the schema name
pub const SCHEMA_ENV: &str = "SPECMEM_DB_SCHEMA";

const MAX_SCHEMA_DIR_CHARS: usize = 50;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database names SQLite reserves on every connection
const RESERVED_SCHEMAS: &[&str] = &["main", "temp"];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Invalid schema name: {0:?}")]
    InvalidSchema(String),
}

impl StoreError {
    /// Errors that mean the store itself is gone or unusable
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::CannotOpen
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::NotADatabase
                    | ErrorCode::DiskFull
                    | ErrorCode::ReadOnly
                    | ErrorCode::PermissionDenied
            ),
            Self::Sqlite(_) => false,
            Self::Io(_) | Self::Task(_) | Self::InvalidSchema(_) => true,
        }
    }
}

/// A project's namespace inside the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectSchema {
    pub name: String,
    pub db_path: PathBuf,
}

/// Schema name derived from the project directory name
pub fn schema_name(project_path: &Path) -> String {
    let dir = project_path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let cleaned = sanitize_identifier(&dir);
    if cleaned.is_empty() {
        return DEFAULT_SCHEMA.to_string();
    }
    let truncated: String = cleaned.chars().take(MAX_SCHEMA_DIR_CHARS).collect();
    format!("specmem_{truncated}")
}

/// Schema name for a project, honoring an explicit override
pub fn resolve_schema_name(project_path: &Path, explicit: Option<&str>) -> String {
    match explicit.map(|s| sanitize_identifier(&s.to_lowercase())) {
        Some(name) if !name.is_empty() => name,
        _ => schema_name(project_path),
    }
}

/// Schema name for a project, honoring `SPECMEM_DB_SCHEMA`
pub fn project_schema_name(project_path: &Path) -> String {
    let explicit = std::env::var(SCHEMA_ENV).ok();
    resolve_schema_name(project_path, explicit.as_deref())
}

/// `[a-z0-9_]` only, `_` runs collapsed, no leading/trailing `_`
fn sanitize_identifier(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '_'
        };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }
    out.trim_matches('_').to_string()
}

/// SHA-256 of the raw content, hex encoded
pub fn content_hash(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}

/// Stable row id for a file in a project
pub fn file_id(project_path: &str, relative_path: &str) -> String {
    let key = format!("{project_path}:{relative_path}");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()).to_string()
}

/// Little-endian f32 BLOB of exactly `dimension` values
pub fn encode_embedding(embedding: &[f32], dimension: usize) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(dimension * 4);
    for i in 0..dimension {
        let value = embedding.get(i).copied().unwrap_or(0.0);
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// A file row ready to be written
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: String,
    pub project_path: String,
    pub relative_path: String,
    pub absolute_path: String,
    pub language_id: String,
    pub language_name: String,
    pub content: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub line_count: usize,
    pub embedding: Option<Vec<f32>>,
}

impl FileRecord {
    fn file_name(&self) -> &str {
        self.relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.relative_path)
    }

    fn extension(&self) -> Option<&str> {
        let name = self.file_name();
        name.rfind('.')
            .filter(|&i| i > 0)
            .map(|i| &name[i + 1..])
    }
}

/// What the store already knows about a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    pub id: String,
    pub content_hash: String,
    /// The file and every one of its definitions have embeddings
    pub has_embedding: bool,
}

/// A stored file still missing its embedding
#[derive(Debug, Clone)]
pub struct PendingFile {
    pub id: String,
    pub relative_path: String,
    pub content: String,
}

/// A stored definition still missing its embedding
#[derive(Debug, Clone)]
pub struct PendingDefinition {
    pub id: String,
    pub file_path: String,
    pub name: String,
    pub kind: String,
    pub signature: String,
}

impl PendingDefinition {
    pub fn embedding_text(&self) -> String {
        definition_text(&self.kind, &self.name, &self.signature, &self.file_path)
    }
}

/// Row counts for one project
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProjectStats {
    pub files: usize,
    pub files_embedded: usize,
    pub definitions: usize,
    pub definitions_embedded: usize,
}

/// SQLite-backed store shared by all pipeline workers
pub struct IndexStore {
    conn: Arc<Mutex<Connection>>,
    data_dir: PathBuf,
    dimension: usize,
}

impl IndexStore {
    /// Open a store whose schema files live in `data_dir`
    pub fn open(data_dir: &Path, dimension: usize) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open_in_memory()?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            data_dir: data_dir.to_path_buf(),
            dimension,
        })
    }

    async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&mut conn.lock())).await?
    }

    /// Attach the project's schema file if it is not attached yet
    pub async fn ensure_schema(&self, project_path: &Path) -> Result<ProjectSchema, StoreError> {
        let name = project_schema_name(project_path);
        self.ensure_named_schema(&name).await
    }

    /// Attach a schema by explicit name.
    ///
    /// The name is reduced to `[a-z0-9_]`; empty and reserved names are rejected.
    pub async fn ensure_named_schema(&self, name: &str) -> Result<ProjectSchema, StoreError> {
        let name = sanitize_identifier(&name.to_lowercase());
        if name.is_empty() || RESERVED_SCHEMAS.contains(&name.as_str()) {
            return Err(StoreError::InvalidSchema(name));
        }
        let schema = ProjectSchema {
            db_path: self.data_dir.join(format!("{name}.db")),
            name,
        };
        let attach = schema.clone();
        self.call(move |conn| {
            let attached: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM pragma_database_list WHERE name = ?1)",
                [&attach.name],
                |row| row.get(0),
            )?;
            if !attached {
                let path = attach.db_path.to_string_lossy().into_owned();
                conn.execute(&format!("ATTACH DATABASE ?1 AS \"{}\"", attach.name), [path])?;
                conn.query_row(
                    &format!("PRAGMA \"{}\".journal_mode = WAL", attach.name),
                    [],
                    |row| row.get::<_, String>(0),
                )?;
                info!(
                    schema = %attach.name,
                    path = %attach.db_path.display(),
                    "Attached project schema"
                );
            }
            Ok(())
        })
        .await?;
        Ok(schema)
    }

    /// Create the file and definition tables if missing
    pub async fn ensure_tables(&self, schema: &ProjectSchema) -> Result<(), StoreError> {
        let s = schema.name.clone();
        self.call(move |conn| {
            conn.execute_batch(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS "{s}".codebase_files (
                    id TEXT PRIMARY KEY,
                    file_path TEXT NOT NULL,
                    absolute_path TEXT NOT NULL,
                    file_name TEXT NOT NULL,
                    extension TEXT,
                    language_id TEXT NOT NULL,
                    language_name TEXT NOT NULL,
                    content TEXT NOT NULL,
                    content_hash TEXT NOT NULL,
                    size_bytes INTEGER NOT NULL,
                    line_count INTEGER NOT NULL,
                    embedding BLOB,
                    project_path TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE (file_path, project_path)
                );
                CREATE INDEX IF NOT EXISTS "{s}".idx_codebase_files_hash
                    ON codebase_files(content_hash);
                CREATE INDEX IF NOT EXISTS "{s}".idx_codebase_files_project
                    ON codebase_files(project_path);

                CREATE TABLE IF NOT EXISTS "{s}".code_definitions (
                    id TEXT PRIMARY KEY,
                    file_id TEXT NOT NULL,
                    file_path TEXT NOT NULL,
                    name TEXT NOT NULL,
                    definition_type TEXT NOT NULL,
                    start_line INTEGER NOT NULL,
                    end_line INTEGER NOT NULL,
                    signature TEXT,
                    is_exported INTEGER NOT NULL DEFAULT 0,
                    project_path TEXT NOT NULL,
                    embedding BLOB,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS "{s}".idx_code_definitions_file
                    ON code_definitions(file_id);
                CREATE INDEX IF NOT EXISTS "{s}".idx_code_definitions_project
                    ON code_definitions(project_path);
                "#
            ))?;
            Ok(())
        })
        .await
    }

    /// Replace the row for `(relative_path, project_path)`
    pub async fn upsert_file(
        &self,
        schema: &ProjectSchema,
        file: FileRecord,
    ) -> Result<(), StoreError> {
        let s = schema.name.clone();
        let dimension = self.dimension;
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let now = Utc::now().to_rfc3339();
            let created_at: Option<String> = tx
                .query_row(
                    &format!(
                        "SELECT created_at FROM \"{s}\".codebase_files
                         WHERE file_path = ?1 AND project_path = ?2"
                    ),
                    params![file.relative_path, file.project_path],
                    |row| row.get(0),
                )
                .optional()?;

            tx.execute(
                &format!(
                    "DELETE FROM \"{s}\".codebase_files WHERE file_path = ?1 AND project_path = ?2"
                ),
                params![file.relative_path, file.project_path],
            )?;

            let embedding = file
                .embedding
                .as_deref()
                .map(|e| encode_embedding(e, dimension));
            tx.execute(
                &format!(
                    "INSERT INTO \"{s}\".codebase_files (
                        id, file_path, absolute_path, file_name, extension,
                        language_id, language_name, content, content_hash,
                        size_bytes, line_count, embedding, project_path,
                        created_at, updated_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    file.id,
                    file.relative_path,
                    file.absolute_path,
                    file.file_name(),
                    file.extension(),
                    file.language_id,
                    file.language_name,
                    file.content,
                    file.content_hash,
                    file.size_bytes as i64,
                    file.line_count as i64,
                    embedding,
                    file.project_path,
                    created_at.unwrap_or_else(|| now.clone()),
                    now,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Write a file's definitions, dropping any it no longer has.
    ///
    /// An existing embedding survives when the incoming one is absent.
    pub async fn upsert_definitions(
        &self,
        schema: &ProjectSchema,
        project_path: &str,
        file_id: &str,
        definitions: Vec<Definition>,
    ) -> Result<usize, StoreError> {
        let s = schema.name.clone();
        let project_path = project_path.to_string();
        let file_id = file_id.to_string();
        let dimension = self.dimension;
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let keep: HashSet<&str> = definitions.iter().map(|d| d.id.as_str()).collect();

            let existing: Vec<String> = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT id FROM \"{s}\".code_definitions WHERE file_id = ?1"
                ))?;
                let rows = stmt.query_map([&file_id], |row| row.get(0))?;
                rows.collect::<Result<_, _>>()?
            };
            let mut orphans = 0;
            for id in existing.iter().filter(|id| !keep.contains(id.as_str())) {
                orphans += tx.execute(
                    &format!("DELETE FROM \"{s}\".code_definitions WHERE id = ?1"),
                    [id],
                )?;
            }
            if orphans > 0 {
                debug!(file_id = %file_id, orphans, "Removed orphaned definitions");
            }

            let now = Utc::now().to_rfc3339();
            {
                let mut stmt = tx.prepare(&format!(
                    "INSERT INTO \"{s}\".code_definitions (
                        id, file_id, file_path, name, definition_type, start_line,
                        end_line, signature, is_exported, project_path, embedding,
                        created_at, updated_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
                     ON CONFLICT(id) DO UPDATE SET
                        file_id = excluded.file_id,
                        file_path = excluded.file_path,
                        name = excluded.name,
                        definition_type = excluded.definition_type,
                        start_line = excluded.start_line,
                        end_line = excluded.end_line,
                        signature = excluded.signature,
                        is_exported = excluded.is_exported,
                        embedding = COALESCE(excluded.embedding, embedding),
                        updated_at = excluded.updated_at"
                ))?;
                for def in &definitions {
                    let embedding = def
                        .embedding
                        .as_deref()
                        .map(|e| encode_embedding(e, dimension));
                    stmt.execute(params![
                        def.id,
                        file_id,
                        def.file_path,
                        def.name,
                        def.kind.as_str(),
                        def.start_line as i64,
                        def.end_line as i64,
                        def.signature,
                        def.is_exported,
                        project_path,
                        embedding,
                        now,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(definitions.len())
        })
        .await
    }

    /// Stored hash and embedding presence for every file of a project.
    ///
    /// A file only counts as embedded when all of its definitions are too.
    pub async fn load_file_states(
        &self,
        schema: &ProjectSchema,
        project_path: &str,
    ) -> Result<HashMap<String, FileState>, StoreError> {
        let s = schema.name.clone();
        let project_path = project_path.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT f.file_path, f.id, f.content_hash,
                        f.embedding IS NOT NULL AND NOT EXISTS (
                            SELECT 1 FROM \"{s}\".code_definitions d
                            WHERE d.file_id = f.id AND d.embedding IS NULL
                        )
                 FROM \"{s}\".codebase_files f WHERE f.project_path = ?1"
            ))?;
            let rows = stmt.query_map([&project_path], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    FileState {
                        id: row.get(1)?,
                        content_hash: row.get(2)?,
                        has_embedding: row.get(3)?,
                    },
                ))
            })?;
            Ok(rows.collect::<Result<HashMap<_, _>, _>>()?)
        })
        .await
    }

    /// Delete files (and their definitions) by relative path
    pub async fn remove_files(
        &self,
        schema: &ProjectSchema,
        project_path: &str,
        relative_paths: Vec<String>,
    ) -> Result<usize, StoreError> {
        if relative_paths.is_empty() {
            return Ok(0);
        }
        let s = schema.name.clone();
        let project_path = project_path.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let mut removed = 0;
            for path in &relative_paths {
                tx.execute(
                    &format!(
                        "DELETE FROM \"{s}\".code_definitions WHERE file_path = ?1 AND project_path = ?2"
                    ),
                    params![path, project_path],
                )?;
                removed += tx.execute(
                    &format!(
                        "DELETE FROM \"{s}\".codebase_files WHERE file_path = ?1 AND project_path = ?2"
                    ),
                    params![path, project_path],
                )?;
            }
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    /// Files without an embedding, ordered by id, starting after `after`
    pub async fn pending_files(
        &self,
        schema: &ProjectSchema,
        project_path: &str,
        after: Option<String>,
        limit: usize,
    ) -> Result<Vec<PendingFile>, StoreError> {
        let s = schema.name.clone();
        let project_path = project_path.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, file_path, content FROM \"{s}\".codebase_files
                 WHERE project_path = ?1 AND embedding IS NULL AND id > ?2
                 ORDER BY id LIMIT ?3"
            ))?;
            let rows = stmt.query_map(
                params![project_path, after.unwrap_or_default(), limit as i64],
                |row| {
                    Ok(PendingFile {
                        id: row.get(0)?,
                        relative_path: row.get(1)?,
                        content: row.get(2)?,
                    })
                },
            )?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    /// Definitions without an embedding, ordered by id, starting after `after`
    pub async fn pending_definitions(
        &self,
        schema: &ProjectSchema,
        project_path: &str,
        after: Option<String>,
        limit: usize,
    ) -> Result<Vec<PendingDefinition>, StoreError> {
        let s = schema.name.clone();
        let project_path = project_path.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, file_path, name, definition_type, COALESCE(signature, '')
                 FROM \"{s}\".code_definitions
                 WHERE project_path = ?1 AND embedding IS NULL AND id > ?2
                 ORDER BY id LIMIT ?3"
            ))?;
            let rows = stmt.query_map(
                params![project_path, after.unwrap_or_default(), limit as i64],
                |row| {
                    Ok(PendingDefinition {
                        id: row.get(0)?,
                        file_path: row.get(1)?,
                        name: row.get(2)?,
                        kind: row.get(3)?,
                        signature: row.get(4)?,
                    })
                },
            )?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    pub async fn set_file_embeddings(
        &self,
        schema: &ProjectSchema,
        embeddings: Vec<(String, Vec<f32>)>,
    ) -> Result<usize, StoreError> {
        self.set_embeddings(schema, "codebase_files", embeddings)
            .await
    }

    pub async fn set_definition_embeddings(
        &self,
        schema: &ProjectSchema,
        embeddings: Vec<(String, Vec<f32>)>,
    ) -> Result<usize, StoreError> {
        self.set_embeddings(schema, "code_definitions", embeddings)
            .await
    }

    async fn set_embeddings(
        &self,
        schema: &ProjectSchema,
        table: &'static str,
        embeddings: Vec<(String, Vec<f32>)>,
    ) -> Result<usize, StoreError> {
        if embeddings.is_empty() {
            return Ok(0);
        }
        let s = schema.name.clone();
        let dimension = self.dimension;
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let now = Utc::now().to_rfc3339();
            let mut updated = 0;
            {
                let mut stmt = tx.prepare(&format!(
                    "UPDATE \"{s}\".{table} SET embedding = ?1, updated_at = ?2 WHERE id = ?3"
                ))?;
                for (id, embedding) in &embeddings {
                    updated +=
                        stmt.execute(params![encode_embedding(embedding, dimension), now, id])?;
                }
            }
            tx.commit()?;
            Ok(updated)
        })
        .await
    }

    /// Row and embedding counts for a project
    pub async fn project_stats(
        &self,
        schema: &ProjectSchema,
        project_path: &str,
    ) -> Result<ProjectStats, StoreError> {
        let s = schema.name.clone();
        let project_path = project_path.to_string();
        self.call(move |conn| {
            let count = |table: &str| -> Result<(usize, usize), rusqlite::Error> {
                conn.query_row(
                    &format!(
                        "SELECT COUNT(*), COUNT(embedding) FROM \"{s}\".{table} WHERE project_path = ?1"
                    ),
                    [&project_path],
                    |row| Ok((row.get::<_, i64>(0)? as usize, row.get::<_, i64>(1)? as usize)),
                )
            };
            let (files, files_embedded) = count("codebase_files")?;
            let (definitions, definitions_embedded) = count("code_definitions")?;
            Ok(ProjectStats {
                files,
                files_embedded,
                definitions,
                definitions_embedded,
            })
        })
        .await
    }

    #[cfg(test)]
    pub(crate) async fn file_embedding(
        &self,
        schema: &ProjectSchema,
        id: &str,
    ) -> Result<Option<Vec<f32>>, StoreError> {
        let s = schema.name.clone();
        let id = id.to_string();
        self.call(move |conn| {
            let blob: Option<Vec<u8>> = conn.query_row(
                &format!("SELECT embedding FROM \"{s}\".codebase_files WHERE id = ?1"),
                [&id],
                |row| row.get(0),
            )?;
            Ok(blob.map(|b| decode_embedding(&b)))
        })
        .await
    }

    #[cfg(test)]
    pub(crate) async fn definition_embedding(
        &self,
        schema: &ProjectSchema,
        id: &str,
    ) -> Result<Option<Vec<f32>>, StoreError> {
        let s = schema.name.clone();
        let id = id.to_string();
        self.call(move |conn| {
            let blob: Option<Vec<u8>> = conn.query_row(
                &format!("SELECT embedding FROM \"{s}\".code_definitions WHERE id = ?1"),
                [&id],
                |row| row.get(0),
            )?;
            Ok(blob.map(|b| decode_embedding(&b)))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::extractor::DefinitionKind;

    const PROJECT: &str = "/work/app";

    async fn open() -> (tempfile::TempDir, IndexStore, ProjectSchema) {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::open(dir.path(), 8).unwrap();
        let schema = store.ensure_named_schema("specmem_app").await.unwrap();
        store.ensure_tables(&schema).await.unwrap();
        (dir, store, schema)
    }

    fn file(rel: &str, content: &str, embedding: Option<Vec<f32>>) -> FileRecord {
        FileRecord {
            id: file_id(PROJECT, rel),
            project_path: PROJECT.into(),
            relative_path: rel.into(),
            absolute_path: format!("{PROJECT}/{rel}"),
            language_id: "rust".into(),
            language_name: "Rust".into(),
            content: content.into(),
            content_hash: content_hash(content.as_bytes()),
            size_bytes: content.len() as u64,
            line_count: content.lines().count(),
            embedding,
        }
    }

    fn definition(
        file_id: &str,
        name: &str,
        line: usize,
        embedding: Option<Vec<f32>>,
    ) -> Definition {
        Definition {
            id: Definition::stable_id(file_id, DefinitionKind::Function, name, line),
            file_id: file_id.into(),
            file_path: "src/lib.rs".into(),
            name: name.into(),
            kind: DefinitionKind::Function,
            start_line: line,
            end_line: line + 2,
            signature: format!("fn {name}()"),
            is_exported: true,
            embedding,
        }
    }

    #[test]
    fn test_schema_name_derivation() {
        assert_eq!(schema_name(Path::new("/home/u/My-Project")), "specmem_my_project");
        assert_eq!(schema_name(Path::new("/srv/a..b__c/")), "specmem_a_b_c");
        assert_eq!(schema_name(Path::new("/")), DEFAULT_SCHEMA);
        assert_eq!(schema_name(Path::new("/tmp/---")), DEFAULT_SCHEMA);
        let long = format!("/x/{}", "a".repeat(80));
        assert_eq!(schema_name(Path::new(&long)).len(), "specmem_".len() + 50);
    }

    #[test]
    fn test_schema_override_is_sanitized() {
        let path = Path::new("/work/app");
        assert_eq!(resolve_schema_name(path, Some("Custom Schema")), "custom_schema");
        assert_eq!(resolve_schema_name(path, Some("\"; DROP")), "drop");
        assert_eq!(resolve_schema_name(path, Some("")), "specmem_app");
        assert_eq!(resolve_schema_name(path, None), "specmem_app");
    }

    #[test]
    fn test_embedding_blob_is_fixed_dimension() {
        assert_eq!(encode_embedding(&[1.0, 2.0], 4).len(), 16);
        assert_eq!(decode_embedding(&encode_embedding(&[1.0, 2.0], 4)), vec![1.0, 2.0, 0.0, 0.0]);
        assert_eq!(decode_embedding(&encode_embedding(&[1.0; 10], 3)), vec![1.0; 3]);
    }

    #[test]
    fn test_fatal_classification() {
        let fatal = StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
            None,
        ));
        assert!(fatal.is_fatal());

        let constraint = StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        ));
        assert!(!constraint.is_fatal());
        assert!(!StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows).is_fatal());
    }

    #[tokio::test]
    async fn test_schema_and_tables_are_idempotent() {
        let (dir, store, schema) = open().await;
        let again = store.ensure_named_schema("specmem_app").await.unwrap();
        store.ensure_tables(&again).await.unwrap();
        assert_eq!(schema, again);
        assert!(dir.path().join("specmem_app.db").exists());
    }

    #[tokio::test]
    async fn test_upsert_file_replaces_row() {
        let (_dir, store, schema) = open().await;
        store.upsert_file(&schema, file("src/lib.rs", "v1", None)).await.unwrap();
        store
            .upsert_file(&schema, file("src/lib.rs", "v2", Some(vec![0.5; 8])))
            .await
            .unwrap();

        let states = store.load_file_states(&schema, PROJECT).await.unwrap();
        assert_eq!(states.len(), 1);
        let state = &states["src/lib.rs"];
        assert_eq!(state.content_hash, content_hash(b"v2"));
        assert!(state.has_embedding);
        assert_eq!(state.id, file_id(PROJECT, "src/lib.rs"));
    }

    #[tokio::test]
    async fn test_stored_embedding_is_resized() {
        let (_dir, store, schema) = open().await;
        let record = file("a.rs", "x", Some(vec![1.0; 3]));
        let id = record.id.clone();
        store.upsert_file(&schema, record).await.unwrap();

        let stored = store.file_embedding(&schema, &id).await.unwrap().unwrap();
        assert_eq!(stored, vec![1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_definition_embedding_never_regresses() {
        let (_dir, store, schema) = open().await;
        let fid = file_id(PROJECT, "src/lib.rs");
        let with = definition(&fid, "load", 1, Some(vec![0.25; 8]));
        let id = with.id.clone();
        store
            .upsert_definitions(&schema, PROJECT, &fid, vec![with])
            .await
            .unwrap();

        let without = definition(&fid, "load", 1, None);
        store
            .upsert_definitions(&schema, PROJECT, &fid, vec![without])
            .await
            .unwrap();

        let stored = store.definition_embedding(&schema, &id).await.unwrap();
        assert_eq!(stored, Some(vec![0.25; 8]));
    }

    #[tokio::test]
    async fn test_orphaned_definitions_are_removed() {
        let (_dir, store, schema) = open().await;
        let fid = file_id(PROJECT, "src/lib.rs");
        store
            .upsert_definitions(
                &schema,
                PROJECT,
                &fid,
                vec![definition(&fid, "keep", 1, None), definition(&fid, "gone", 10, None)],
            )
            .await
            .unwrap();
        store
            .upsert_definitions(&schema, PROJECT, &fid, vec![definition(&fid, "keep", 1, None)])
            .await
            .unwrap();

        let stats = store.project_stats(&schema, PROJECT).await.unwrap();
        assert_eq!(stats.definitions, 1);
    }

    #[tokio::test]
    async fn test_pending_rows_and_backfill() {
        let (_dir, store, schema) = open().await;
        for name in ["a.rs", "b.rs", "c.rs"] {
            store.upsert_file(&schema, file(name, name, None)).await.unwrap();
        }
        store
            .upsert_file(&schema, file("done.rs", "done", Some(vec![1.0; 8])))
            .await
            .unwrap();

        let first = store.pending_files(&schema, PROJECT, None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let rest = store
            .pending_files(&schema, PROJECT, Some(first[1].id.clone()), 10)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);

        let updates: Vec<(String, Vec<f32>)> = first
            .iter()
            .chain(rest.iter())
            .map(|p| (p.id.clone(), vec![2.0; 8]))
            .collect();
        assert_eq!(store.set_file_embeddings(&schema, updates).await.unwrap(), 3);

        let stats = store.project_stats(&schema, PROJECT).await.unwrap();
        assert_eq!(stats.files, 4);
        assert_eq!(stats.files_embedded, 4);
        assert!(store
            .pending_files(&schema, PROJECT, None, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_pending_definition_text() {
        let (_dir, store, schema) = open().await;
        let fid = file_id(PROJECT, "src/lib.rs");
        store
            .upsert_definitions(&schema, PROJECT, &fid, vec![definition(&fid, "load", 3, None)])
            .await
            .unwrap();

        let pending = store
            .pending_definitions(&schema, PROJECT, None, 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].embedding_text(), "function load\nfn load()\nsrc/lib.rs");
    }

    #[tokio::test]
    async fn test_remove_files_drops_definitions() {
        let (_dir, store, schema) = open().await;
        let record = file("src/lib.rs", "x", None);
        let fid = record.id.clone();
        store.upsert_file(&schema, record).await.unwrap();
        store
            .upsert_definitions(&schema, PROJECT, &fid, vec![definition(&fid, "load", 1, None)])
            .await
            .unwrap();

        let removed = store
            .remove_files(&schema, PROJECT, vec!["src/lib.rs".into()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(
            store.project_stats(&schema, PROJECT).await.unwrap(),
            ProjectStats::default()
        );
    }

    #[tokio::test]
    async fn test_unembedded_definition_marks_file_pending() {
        let (_dir, store, schema) = open().await;
        let record = file("src/lib.rs", "x", Some(vec![1.0; 8]));
        let fid = record.id.clone();
        store.upsert_file(&schema, record).await.unwrap();
        store
            .upsert_definitions(
                &schema,
                PROJECT,
                &fid,
                vec![
                    definition(&fid, "load", 1, Some(vec![1.0; 8])),
                    definition(&fid, "save", 5, None),
                ],
            )
            .await
            .unwrap();

        let states = store.load_file_states(&schema, PROJECT).await.unwrap();
        assert!(!states["src/lib.rs"].has_embedding);

        let pending = store
            .pending_definitions(&schema, PROJECT, None, 10)
            .await
            .unwrap();
        let updates = pending.into_iter().map(|d| (d.id, vec![2.0; 8])).collect();
        store.set_definition_embeddings(&schema, updates).await.unwrap();

        let states = store.load_file_states(&schema, PROJECT).await.unwrap();
        assert!(states["src/lib.rs"].has_embedding);
    }

    #[tokio::test]
    async fn test_schema_names_are_sanitized_and_reserved_names_rejected() {
        let (dir, store, _schema) = open().await;
        let schema = store.ensure_named_schema("My\"; DROP--").await.unwrap();
        assert_eq!(schema.name, "my_drop");
        assert_eq!(schema.db_path, dir.path().join("my_drop.db"));

        for name in ["main", "TEMP", "", "--"] {
            let err = store.ensure_named_schema(name).await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidSchema(_)), "{name}");
        }
    }

    #[tokio::test]
    async fn test_ensure_schema_derives_name_from_path() {
        let (dir, store, _schema) = open().await;
        let schema = store
            .ensure_schema(Path::new("/work/Billing-Service"))
            .await
            .unwrap();
        store.ensure_tables(&schema).await.unwrap();
        assert_eq!(schema.name, "specmem_billing_service");
        assert!(dir.path().join("specmem_billing_service.db").exists());
    }

    #[tokio::test]
    async fn test_projects_are_isolated_by_path() {
        let (_dir, store, schema) = open().await;
        store.upsert_file(&schema, file("a.rs", "x", None)).await.unwrap();
        let other = store.load_file_states(&schema, "/other").await.unwrap();
        assert!(other.is_empty());
    }
}
