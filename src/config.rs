//! Runtime configuration for the indexer. Loaded from `.coderag.toml` or defaults.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Per-file byte cap; files above are skipped entirely.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024;

/// Files read, chunked, and tokenized per build batch.
pub const DEFAULT_INDEXING_BATCH_SIZE: usize = 50;

/// Chunks per embedding-provider call.
pub const DEFAULT_VECTOR_BATCH_SIZE: usize = 10;

/// Indexer configuration. Field semantics follow the library contract;
/// construct with [`IndexerConfig::new`] and adjust with the builder setters.
#[derive(Clone, Debug)]
pub struct IndexerConfig {
    /// Directory to index.
    pub codebase_root: PathBuf,
    /// Per-file byte cap; larger files never reach the index.
    pub max_file_size: u64,
    /// Files per build batch.
    pub indexing_batch_size: usize,
    /// Chunks per embedding call.
    pub vector_batch_size: usize,
    /// When true, queries run against the store without loading the full
    /// index into memory. Recommended with the persistent store.
    pub low_memory_mode: bool,
    /// Start the watcher after the initial build.
    pub watch: bool,
    /// Override for the per-project data directory. `None` resolves to
    /// `~/.coderag/projects/<hash>/`.
    pub data_dir: Option<PathBuf>,
    /// Maximum characters per chunk before the chunker splits.
    pub max_chunk_size: usize,
}

impl IndexerConfig {
    pub fn new(codebase_root: impl Into<PathBuf>) -> Self {
        Self {
            codebase_root: codebase_root.into(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            indexing_batch_size: DEFAULT_INDEXING_BATCH_SIZE,
            vector_batch_size: DEFAULT_VECTOR_BATCH_SIZE,
            low_memory_mode: true,
            watch: false,
            data_dir: None,
            max_chunk_size: 2000,
        }
    }

    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn indexing_batch_size(mut self, files: usize) -> Self {
        self.indexing_batch_size = files;
        self
    }

    pub fn vector_batch_size(mut self, chunks: usize) -> Self {
        self.vector_batch_size = chunks;
        self
    }

    pub fn low_memory_mode(mut self, enabled: bool) -> Self {
        self.low_memory_mode = enabled;
        self
    }

    pub fn watch(mut self, enabled: bool) -> Self {
        self.watch = enabled;
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Validate the configuration. Called once at indexer construction.
    pub fn validate(&self) -> Result<()> {
        if !self.codebase_root.is_dir() {
            return Err(Error::Config(format!(
                "codebase root is not a directory: {}",
                self.codebase_root.display()
            )));
        }
        if self.indexing_batch_size == 0 {
            return Err(Error::Config("indexing_batch_size must be at least 1".into()));
        }
        if self.vector_batch_size == 0 {
            return Err(Error::Config("vector_batch_size must be at least 1".into()));
        }
        if self.max_chunk_size < 100 {
            return Err(Error::Config("max_chunk_size must be at least 100".into()));
        }
        Ok(())
    }

    /// Apply overrides from `.coderag.toml` at the codebase root, if present.
    /// Missing file is not an error; a malformed file is.
    pub fn load_overrides(mut self) -> Result<Self> {
        let path = self.codebase_root.join(".coderag.toml");
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(self),
            Err(e) => return Err(Error::io(path, e)),
        };
        let file: ConfigFile = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;

        if let Some(v) = file.max_file_size {
            self.max_file_size = v;
        }
        if let Some(v) = file.indexing_batch_size {
            self.indexing_batch_size = v;
        }
        if let Some(v) = file.vector_batch_size {
            self.vector_batch_size = v;
        }
        if let Some(v) = file.low_memory_mode {
            self.low_memory_mode = v;
        }
        if let Some(v) = file.watch {
            self.watch = v;
        }
        if let Some(v) = file.max_chunk_size {
            self.max_chunk_size = v;
        }
        Ok(self)
    }
}

/// On-disk shape of `.coderag.toml`. All fields optional.
#[derive(Deserialize, Default)]
struct ConfigFile {
    max_file_size: Option<u64>,
    indexing_batch_size: Option<usize>,
    vector_batch_size: Option<usize>,
    low_memory_mode: Option<bool>,
    watch: Option<bool>,
    max_chunk_size: Option<usize>,
}

/// Normalize a path relative to a root into the forward-slash form used as
/// the file identity everywhere in the index.
pub fn normalize_rel_path(root: &Path, abs: &Path) -> Option<String> {
    abs.strip_prefix(root).ok().map(|p| p.to_string_lossy().replace('\\', "/"))
}
