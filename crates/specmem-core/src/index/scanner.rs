//! Project tree walker
//!
//! Yields indexable files lazily. Dependency, build, and VCS directories are
//! pruned before descent; dotfiles are skipped unless allow-listed.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use super::language::Language;
use crate::config::{IndexConfig, PROJECT_DATA_DIR};

/// Directories never descended into
const EXCLUDED_DIRS: &[&str] = &[
    "node_modules",
    "target",
    "dist",
    "build",
    "out",
    "vendor",
    "coverage",
    "__pycache__",
    "venv",
    ".venv",
    ".git",
    ".hg",
    ".svn",
    ".next",
    ".nuxt",
    ".cache",
    ".turbo",
    ".idea",
    ".vscode",
    ".pytest_cache",
    ".mypy_cache",
    ".tox",
    "bower_components",
    PROJECT_DATA_DIR,
];

/// Dot-prefixed names that are still indexed
const DOT_ALLOW_LIST: &[&str] = &[
    ".github",
    ".gitlab-ci.yml",
    ".eslintrc.js",
    ".eslintrc.json",
    ".prettierrc",
    ".babelrc",
    ".env.example",
    ".editorconfig",
];

/// A file the scanner found worth indexing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub absolute_path: PathBuf,
    /// Relative to the project root, `/`-separated
    pub relative_path: String,
    pub language: Language,
}

/// Parts of the tree the walk could not read.
///
/// Files under these paths may still exist on disk even though the scan did
/// not yield them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Unreadable {
    prefixes: Vec<String>,
    /// An error without a usable path; nothing can be ruled out
    unknown: bool,
}

impl Unreadable {
    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty() && !self.unknown
    }

    /// Whether `relative_path` lies in a part of the tree the walk missed
    pub fn covers(&self, relative_path: &str) -> bool {
        self.unknown
            || self.prefixes.iter().any(|prefix| {
                prefix.is_empty()
                    || relative_path == prefix
                    || relative_path
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            })
    }
}

pub struct FileScanner {
    root: PathBuf,
    max_depth: usize,
    follow_symlinks: bool,
    excludes: Vec<glob::Pattern>,
    unreadable: Mutex<Unreadable>,
}

impl FileScanner {
    pub fn new(root: &Path, config: &IndexConfig) -> Self {
        let excludes = config
            .exclude_patterns
            .iter()
            .filter_map(|p| match glob::Pattern::new(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "Ignoring invalid exclude pattern");
                    None
                }
            })
            .collect();

        Self {
            root: root.to_path_buf(),
            max_depth: config.max_depth,
            follow_symlinks: config.follow_symlinks,
            excludes,
            unreadable: Mutex::new(Unreadable::default()),
        }
    }

    /// What the walk failed to read so far
    pub fn unreadable(&self) -> Unreadable {
        self.unreadable.lock().clone()
    }

    /// Walk the tree. The iterator is single-pass.
    pub fn scan(&self) -> impl Iterator<Item = ScannedFile> + '_ {
        WalkDir::new(&self.root)
            .max_depth(self.max_depth)
            .follow_links(self.follow_symlinks)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_excluded(entry))
            .filter_map(move |entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    if let Some(ancestor) = e.loop_ancestor() {
                        warn!(path = %ancestor.display(), "Skipping symlink loop");
                    } else {
                        warn!(error = %e, "Skipping unreadable entry");
                    }
                    self.record_unreadable(e.path());
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .filter_map(move |entry| self.to_scanned(entry))
    }

    fn record_unreadable(&self, path: Option<&Path>) {
        let mut unreadable = self.unreadable.lock();
        match path.and_then(|p| relative_path(&self.root, p)) {
            Some(rel) => unreadable.prefixes.push(rel),
            None => unreadable.unknown = true,
        }
    }

    fn to_scanned(&self, entry: DirEntry) -> Option<ScannedFile> {
        let relative_path = relative_path(&self.root, entry.path())?;
        if self.excludes.iter().any(|p| p.matches(&relative_path)) {
            debug!(path = %relative_path, "Excluded by pattern");
            return None;
        }
        let language = Language::detect(entry.path())?;
        Some(ScannedFile {
            absolute_path: entry.into_path(),
            relative_path,
            language,
        })
    }
}

fn is_excluded(entry: &DirEntry) -> bool {
    let Some(name) = entry.file_name().to_str() else {
        return true;
    };
    if entry.file_type().is_dir() && EXCLUDED_DIRS.contains(&name) {
        return true;
    }
    name.starts_with('.') && !DOT_ALLOW_LIST.contains(&name)
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<&str> = rel
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    Some(parts.join("/"))
}
