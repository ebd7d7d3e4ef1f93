//! A minimal async filesystem abstraction so the Source Scanner can be unit
//! tested without touching `/sys/kernel/debug`. Grounded on the teacher's
//! `ferrex-core/src/scanner/fs.rs` `FileSystem`/`RealFs`/`InMemoryFs` split.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

/// Filesystem operations the Source Scanner needs: glob expansion and
/// whole-file reads.
#[async_trait]
pub trait SourceFs: Send + Sync {
    /// Expands a glob pattern to the set of currently matching paths.
    async fn glob_paths(&self, pattern: &str) -> Vec<PathBuf>;

    /// Reads a whole file's contents. Any I/O error (including the file
    /// vanishing between `glob_paths` and this call) is surfaced to the
    /// caller, which treats it as best-effort per §4.1.
    async fn read_to_string(&self, path: &Path) -> std::io::Result<String>;
}

/// Real filesystem implementation backed by the `glob` crate and
/// `tokio::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealSourceFs;

#[async_trait]
impl SourceFs for RealSourceFs {
    async fn glob_paths(&self, pattern: &str) -> Vec<PathBuf> {
        match glob::glob(pattern) {
            Ok(paths) => paths.filter_map(Result::ok).collect(),
            Err(err) => {
                tracing::warn!("invalid mdt_watch_glob pattern {pattern}: {err}");
                Vec::new()
            }
        }
    }

    async fn read_to_string(&self, path: &Path) -> std::io::Result<String> {
        tokio::fs::read_to_string(path).await
    }
}

/// In-memory filesystem fake used by Scanner unit tests.
#[derive(Debug, Default, Clone)]
pub struct InMemorySourceFs {
    files: HashMap<PathBuf, String>,
}

impl InMemorySourceFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_file(&mut self, path: impl Into<PathBuf>, contents: impl Into<String>) {
        self.files.insert(path.into(), contents.into());
    }

    pub fn remove_file(&mut self, path: impl AsRef<Path>) {
        self.files.remove(path.as_ref());
    }
}

#[async_trait]
impl SourceFs for InMemorySourceFs {
    async fn glob_paths(&self, pattern: &str) -> Vec<PathBuf> {
        // Tests only ever need literal-prefix matching against the fixed
        // paths they registered; the production glob semantics are fully
        // exercised against `RealSourceFs` by the crate's integration point,
        // not unit tests.
        let prefix = pattern.split('*').next().unwrap_or(pattern);
        let mut matches: Vec<PathBuf> = self
            .files
            .keys()
            .filter(|p| p.to_string_lossy().starts_with(prefix))
            .cloned()
            .collect();
        matches.sort();
        matches
    }

    async fn read_to_string(&self, path: &Path) -> std::io::Result<String> {
        self.files.get(path).cloned().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no such fake file")
        })
    }
}
