//! Index builder and top-level facade.
//!
//! Orchestrates full and incremental builds: scan → diff → per-batch read,
//! chunk, tokenize (in parallel) → serialized store writes → the four global
//! recomputations in order → cache invalidation → embedding dispatch. The
//! watcher calls back into the per-path reconciliation entry points here.

use rayon::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use xxhash_rust::xxh32::xxh32;

use crate::cache::{QueryResultCache, QueryTokenCache};
use crate::chunker::{language_tag, ChunkResult, Chunker};
use crate::config::IndexerConfig;
use crate::diff::{diff_index, IndexDiff};
use crate::error::{Error, Result};
use crate::project::{now_ms, resolve_layout};
use crate::query::{MemoryIndex, QueryEngine, SearchOptions, SearchResult};
use crate::scan::{is_text_file, mtime_ms, scan_files, FsEntry};
use crate::store::{ChunkInsert, ChunkVectors, FileRecord, IndexStore, StoredFileMeta};
use crate::tokenizer::CodeTokenizer;
use crate::vector::{
    chunk_id_prefix, chunk_vector_id, content_preview, EmbeddingProvider, VectorMetadata,
    VectorStore,
};

/// Outcome of one `index()` pass.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct IndexReport {
    pub added: usize,
    /// Confirmed content changes; mtime-only touches land in `unchanged`.
    pub changed: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub chunks_indexed: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexStats {
    pub files: u64,
    pub chunks: u64,
    pub terms: u64,
    pub avg_doc_length: f64,
}

/// One file fully prepared for storage: its row, chunk rows, and per-chunk
/// term frequencies.
struct PreparedFile {
    record: FileRecord,
    chunks: Vec<ChunkResult>,
    inserts: Vec<ChunkInsert>,
    freqs: Vec<(Vec<(String, u32)>, u32)>,
}

enum Prepared {
    File(Box<PreparedFile>),
    /// Content hash matched the stored row: refresh mtime only.
    HashSkip { path: String, mtime: i64 },
    /// Read failed or the file stopped qualifying; nothing is written.
    Skipped,
}

pub struct Indexer {
    config: IndexerConfig,
    store: Arc<IndexStore>,
    tokenizer: Arc<CodeTokenizer>,
    chunker: Arc<Chunker>,
    result_cache: Arc<QueryResultCache<Vec<SearchResult>>>,
    token_cache: Arc<QueryTokenCache>,
    engine: QueryEngine,
    vector_store: Option<Arc<dyn VectorStore>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    memory_index: Mutex<Option<Arc<MemoryIndex>>>,
    closed: AtomicBool,
}

impl Indexer {
    /// Validate the configuration, resolve the project data directory, and
    /// open the relational store.
    pub fn open(config: IndexerConfig) -> Result<Self> {
        config.validate()?;
        let layout = resolve_layout(&config.codebase_root, config.data_dir.as_deref())?;
        let store = Arc::new(IndexStore::open(&layout.db_path)?);
        Ok(Self::from_parts(config, store))
    }

    fn from_parts(config: IndexerConfig, store: Arc<IndexStore>) -> Self {
        let tokenizer = Arc::new(CodeTokenizer::new());
        let result_cache = Arc::new(QueryResultCache::default());
        let token_cache = Arc::new(QueryTokenCache::default());
        let engine = QueryEngine::new(
            Arc::clone(&store),
            Arc::clone(&tokenizer),
            Arc::clone(&result_cache),
            Arc::clone(&token_cache),
        );
        Self {
            config,
            store,
            tokenizer,
            chunker: Arc::new(Chunker::new()),
            result_cache,
            token_cache,
            engine,
            vector_store: None,
            embedder: None,
            memory_index: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Attach an ANN store and embedding provider; enables the vector leg of
    /// indexing and hybrid queries.
    pub fn with_vector_store(
        mut self,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        self.engine = self
            .engine
            .with_vector_store(Arc::clone(&vectors), Arc::clone(&embedder));
        self.vector_store = Some(vectors);
        self.embedder = Some(embedder);
        self
    }

    pub fn vector_weight(mut self, weight: f64) -> Self {
        self.engine = self.engine.vector_weight(weight);
        self
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Build
    // -----------------------------------------------------------------------

    /// Full or incremental build: diff the filesystem against the store and
    /// process only what moved. Safe to call repeatedly; a pass over an
    /// unchanged tree writes nothing.
    pub fn index(&self) -> Result<IndexReport> {
        self.ensure_open()?;
        let start = std::time::Instant::now();

        let fs_view = scan_files(&self.config.codebase_root, self.config.max_file_size);
        let stored = self.store.all_file_meta()?;
        let stored_by_path: HashMap<String, StoredFileMeta> =
            stored.iter().map(|m| (m.path.clone(), m.clone())).collect();
        let diff = diff_index(fs_view, &stored);

        let mut report = IndexReport {
            unchanged: diff.unchanged,
            deleted: diff.deleted.len(),
            ..Default::default()
        };
        let IndexDiff { added, changed, deleted, .. } = diff;

        let mut mutated = false;
        if !deleted.is_empty() {
            self.store.delete_files(&deleted)?;
            self.delete_vector_docs(&deleted);
            mutated = true;
        }

        let changed_set: std::collections::HashSet<String> =
            changed.iter().map(|e| e.rel_path.clone()).collect();
        let mut embed_jobs: Vec<(String, ChunkResult, Option<String>)> = Vec::new();
        let mut refreshed_paths: Vec<String> = Vec::new();

        let to_process: Vec<FsEntry> = added.into_iter().chain(changed).collect();
        for batch in to_process.chunks(self.config.indexing_batch_size) {
            let prepared: Vec<Prepared> = batch
                .par_iter()
                .map(|entry| self.prepare_file(entry, &stored_by_path))
                .collect();

            let mut files: Vec<FileRecord> = Vec::new();
            let mut per_file: Vec<PreparedFile> = Vec::new();
            for p in prepared {
                match p {
                    Prepared::File(file) => {
                        files.push(file.record.clone());
                        per_file.push(*file);
                    }
                    Prepared::HashSkip { path, mtime } => {
                        self.store.touch_file_mtime(&path, mtime)?;
                        report.unchanged += 1;
                    }
                    Prepared::Skipped => {}
                }
            }
            if files.is_empty() {
                continue;
            }

            self.store.store_files(&files)?;
            let file_chunks: Vec<(String, Vec<ChunkInsert>)> = per_file
                .iter()
                .map(|f| (f.record.path.clone(), f.inserts.clone()))
                .collect();
            let ids_by_path = self.store.store_many_chunks(&file_chunks)?;

            let mut vectors: Vec<ChunkVectors> = Vec::new();
            for f in &per_file {
                let ids = &ids_by_path[&f.record.path];
                for (chunk_id, (term_freqs, token_count)) in ids.iter().zip(f.freqs.iter()) {
                    vectors.push(ChunkVectors {
                        chunk_id: *chunk_id,
                        token_count: *token_count,
                        term_freqs: term_freqs.clone(),
                    });
                }
                report.chunks_indexed += f.chunks.len();
                if changed_set.contains(&f.record.path) {
                    report.changed += 1;
                } else {
                    report.added += 1;
                }
                refreshed_paths.push(f.record.path.clone());
                for chunk in &f.chunks {
                    embed_jobs.push((
                        f.record.path.clone(),
                        chunk.clone(),
                        f.record.language.clone(),
                    ));
                }
            }
            self.store.store_many_chunk_vectors(&vectors)?;
            mutated = true;
        }

        if mutated {
            self.recompute_scores()?;
            self.invalidate_query_state();
        }

        if !refreshed_paths.is_empty() {
            self.refresh_vector_docs(&refreshed_paths, embed_jobs);
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            added = report.added,
            changed = report.changed,
            deleted = report.deleted,
            unchanged = report.unchanged,
            chunks = report.chunks_indexed,
            time_ms = report.duration_ms,
            "index pass complete"
        );
        Ok(report)
    }

    /// Read, hash, chunk, and tokenize one file. Runs in parallel across a
    /// batch; does not touch the store.
    fn prepare_file(
        &self,
        entry: &FsEntry,
        stored_by_path: &HashMap<String, StoredFileMeta>,
    ) -> Prepared {
        let content = match std::fs::read_to_string(&entry.abs_path) {
            Ok(c) => c,
            Err(e) => {
                warn!(file = %entry.rel_path, error = %e, "read failed, skipping file");
                return Prepared::Skipped;
            }
        };
        let hash = xxh32(content.as_bytes(), 0);
        if let Some(stored) = stored_by_path.get(&entry.rel_path) {
            if stored.hash == hash {
                // a touch, not a change
                return Prepared::HashSkip { path: entry.rel_path.clone(), mtime: entry.mtime };
            }
        }

        let chunks = match self.chunk_with_retry(&entry.rel_path, &content) {
            Ok(c) => c,
            Err(e) => {
                warn!(file = %entry.rel_path, error = %e, "chunking failed, skipping file");
                return Prepared::Skipped;
            }
        };

        let ext = entry.rel_path.rsplit('.').next().unwrap_or("");
        let freqs: Vec<(Vec<(String, u32)>, u32)> = chunks
            .iter()
            .map(|c| {
                let (map, total) = self.tokenizer.term_frequencies(&c.content);
                let mut pairs: Vec<(String, u32)> = map.into_iter().collect();
                pairs.sort_by(|a, b| a.0.cmp(&b.0));
                (pairs, total)
            })
            .collect();
        let inserts = chunks
            .iter()
            .map(|c| ChunkInsert {
                content: c.content.clone(),
                kind: c.kind.clone(),
                start_line: c.start_line,
                end_line: c.end_line,
                metadata_json: serde_json::Value::Object(c.metadata.clone()).to_string(),
            })
            .collect();

        Prepared::File(Box::new(PreparedFile {
            record: FileRecord {
                path: entry.rel_path.clone(),
                content,
                hash,
                size: entry.size,
                mtime: entry.mtime,
                language: language_tag(ext).map(str::to_string),
                indexed_at: now_ms(),
            },
            chunks,
            inserts,
            freqs,
        }))
    }

    fn chunk_with_retry(&self, path: &str, content: &str) -> Result<Vec<ChunkResult>> {
        match self.chunker.chunk(path, content, self.config.max_chunk_size) {
            Err(e) if e.is_retryable() => self.chunker.chunk(path, content, self.config.max_chunk_size),
            other => other,
        }
    }

    /// The four global recomputations, in their required order.
    fn recompute_scores(&self) -> Result<()> {
        self.store.rebuild_idf_scores_from_vectors()?;
        self.store.recalculate_tfidf_scores()?;
        self.store.update_chunk_magnitudes()?;
        self.store.update_average_doc_length()?;
        Ok(())
    }

    /// Every mutation funnels through here before queries resume.
    fn invalidate_query_state(&self) {
        self.result_cache.invalidate();
        *self.lock_memory_index() = None;
    }

    fn lock_memory_index(&self) -> std::sync::MutexGuard<'_, Option<Arc<MemoryIndex>>> {
        match self.memory_index.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // -----------------------------------------------------------------------
    // Vector maintenance
    // -----------------------------------------------------------------------

    fn delete_vector_docs(&self, paths: &[String]) {
        let Some(vectors) = &self.vector_store else { return };
        for path in paths {
            if let Err(e) = vectors.delete_by_prefix(&chunk_id_prefix(path)) {
                warn!(file = %path, error = %e, "vector delete failed");
            }
        }
    }

    /// Replace the vector documents of the given files. Provider or store
    /// failure skips the affected batch and keeps going; BM25 stays intact.
    fn refresh_vector_docs(&self, paths: &[String], jobs: Vec<(String, ChunkResult, Option<String>)>) {
        let (Some(vectors), Some(embedder)) = (&self.vector_store, &self.embedder) else {
            return;
        };
        self.delete_vector_docs(paths);

        for batch in jobs.chunks(self.config.vector_batch_size) {
            let texts: Vec<String> = batch.iter().map(|(_, c, _)| c.content.clone()).collect();
            let embeddings = match embedder.embed(&texts) {
                Ok(e) if e.len() == batch.len() => e,
                Ok(e) => {
                    warn!(got = e.len(), want = batch.len(), "embedding batch size mismatch, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "embedding batch failed, skipping");
                    continue;
                }
            };
            for ((path, chunk, language), embedding) in batch.iter().zip(embeddings) {
                let id = chunk_vector_id(path, chunk.start_line, chunk.end_line);
                let metadata = VectorMetadata {
                    kind: chunk.kind.clone(),
                    language: language.clone(),
                    preview: content_preview(&chunk.content),
                    path: path.clone(),
                    start_line: chunk.start_line,
                    end_line: chunk.end_line,
                };
                if let Err(e) = vectors.upsert(&id, &embedding, metadata) {
                    warn!(id = %id, error = %e, "vector upsert failed");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Watcher reconciliation (one path at a time)
    // -----------------------------------------------------------------------

    /// Remove one path from the index. Returns true if anything was removed.
    pub fn reconcile_delete(&self, rel_path: &str) -> Result<bool> {
        self.ensure_open()?;
        let removed = self.store.delete_files(&[rel_path.to_string()])?;
        if removed == 0 {
            return Ok(false);
        }
        self.delete_vector_docs(&[rel_path.to_string()]);
        self.recompute_scores()?;
        self.invalidate_query_state();
        debug!(file = rel_path, "reconciled delete");
        Ok(true)
    }

    /// Re-index one path after a create/modify event. Hash-verified: content
    /// identical to the stored row writes nothing. Returns true when the
    /// index changed.
    pub fn reconcile_upsert(&self, rel_path: &str) -> Result<bool> {
        self.ensure_open()?;
        let abs_path = self.config.codebase_root.join(rel_path);
        let meta = match std::fs::metadata(&abs_path) {
            Ok(m) => m,
            Err(_) => return self.reconcile_delete(rel_path),
        };
        if meta.len() > self.config.max_file_size || !is_text_file(&abs_path) {
            // stopped qualifying; drop it if we have it
            return self.reconcile_delete(rel_path);
        }
        let entry = FsEntry {
            rel_path: rel_path.to_string(),
            abs_path,
            size: meta.len(),
            mtime: mtime_ms(&meta),
        };

        let stored = self.store.file_meta(rel_path)?;
        let stored_by_path: HashMap<String, StoredFileMeta> = stored
            .into_iter()
            .map(|m| (m.path.clone(), m))
            .collect();

        match self.prepare_file(&entry, &stored_by_path) {
            Prepared::HashSkip { path, mtime } => {
                self.store.touch_file_mtime(&path, mtime)?;
                Ok(false)
            }
            Prepared::Skipped => Err(Error::io(
                entry.abs_path,
                std::io::Error::new(std::io::ErrorKind::Other, "reconciliation abandoned"),
            )),
            Prepared::File(file) => {
                self.store.store_files(std::slice::from_ref(&file.record))?;
                let ids = self
                    .store
                    .store_many_chunks(&[(file.record.path.clone(), file.inserts.clone())])?;
                let chunk_ids = &ids[&file.record.path];
                let vectors: Vec<ChunkVectors> = chunk_ids
                    .iter()
                    .zip(file.freqs.iter())
                    .map(|(id, (term_freqs, token_count))| ChunkVectors {
                        chunk_id: *id,
                        token_count: *token_count,
                        term_freqs: term_freqs.clone(),
                    })
                    .collect();
                self.store.store_many_chunk_vectors(&vectors)?;
                self.recompute_scores()?;
                self.invalidate_query_state();

                let jobs: Vec<(String, ChunkResult, Option<String>)> = file
                    .chunks
                    .iter()
                    .map(|c| (file.record.path.clone(), c.clone(), file.record.language.clone()))
                    .collect();
                self.refresh_vector_docs(&[file.record.path.clone()], jobs);
                debug!(file = rel_path, chunks = file.chunks.len(), "reconciled change");
                Ok(true)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Queries & maintenance
    // -----------------------------------------------------------------------

    pub fn search(&self, query: &str, opts: &SearchOptions) -> Result<Vec<SearchResult>> {
        self.ensure_open()?;
        if self.config.low_memory_mode {
            self.engine.search(query, opts)
        } else {
            let memory = self.memory_index_handle()?;
            Ok(memory.search(&self.tokenizer, query, opts))
        }
    }

    fn memory_index_handle(&self) -> Result<Arc<MemoryIndex>> {
        let mut guard = self.lock_memory_index();
        if let Some(existing) = guard.as_ref() {
            return Ok(Arc::clone(existing));
        }
        let built = Arc::new(MemoryIndex::build(&self.store, &self.tokenizer)?);
        *guard = Some(Arc::clone(&built));
        Ok(built)
    }

    /// Stored content of an indexed file.
    pub fn file_content(&self, rel_path: &str) -> Result<Option<String>> {
        self.ensure_open()?;
        self.store.file_content(rel_path)
    }

    pub fn stats(&self) -> Result<IndexStats> {
        self.ensure_open()?;
        Ok(IndexStats {
            files: self.store.file_count()?,
            chunks: self.store.chunk_count()?,
            terms: self.store.term_count()?,
            avg_doc_length: self.store.average_doc_length()?,
        })
    }

    /// Drop the whole index: every row, every vector document, all caches.
    pub fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        self.store.clear()?;
        if let Some(vectors) = &self.vector_store {
            if let Err(e) = vectors.delete_by_prefix("chunk://") {
                warn!(error = %e, "vector clear failed");
            }
        }
        self.invalidate_query_state();
        self.token_cache.clear();
        Ok(())
    }

    /// Close the indexer: further calls fail with [`Error::Closed`]. Caches
    /// are emptied; the store connection drops with the indexer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.invalidate_query_state();
        self.token_cache.clear();
    }

    pub(crate) fn root(&self) -> &Path {
        &self.config.codebase_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture(files: &[(&str, &str)]) -> (TempDir, TempDir, Indexer) {
        let repo = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        for (rel, content) in files {
            let path = repo.path().join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, content).unwrap();
        }
        let indexer =
            Indexer::open(IndexerConfig::new(repo.path()).data_dir(data.path())).unwrap();
        (repo, data, indexer)
    }

    #[test]
    fn test_mutation_empties_query_cache() {
        let (repo, _data, indexer) = fixture(&[("a.rs", "fn cached_term() {}\n")]);
        indexer.index().unwrap();

        let opts = SearchOptions::default();
        indexer.search("cached_term", &opts).unwrap();
        assert_eq!(indexer.result_cache.len(), 1);

        std::fs::write(repo.path().join("b.rs"), "fn newcomer() {}\n").unwrap();
        indexer.index().unwrap();
        assert!(indexer.result_cache.is_empty(), "mutation must empty the query cache");
    }

    #[test]
    fn test_unchanged_pass_keeps_query_cache() {
        let (_repo, _data, indexer) = fixture(&[("a.rs", "fn cached_term() {}\n")]);
        indexer.index().unwrap();
        indexer.search("cached_term", &SearchOptions::default()).unwrap();
        assert_eq!(indexer.result_cache.len(), 1);

        // no filesystem change: second pass writes nothing and keeps the cache
        indexer.index().unwrap();
        assert_eq!(indexer.result_cache.len(), 1);
    }

    #[test]
    fn test_reconcile_upsert_and_hash_skip() {
        let (repo, _data, indexer) = fixture(&[]);
        std::fs::write(repo.path().join("live.rs"), "fn first_version() {}\n").unwrap();
        assert!(indexer.reconcile_upsert("live.rs").unwrap());
        assert_eq!(indexer.stats().unwrap().files, 1);

        // identical content: nothing to do
        assert!(!indexer.reconcile_upsert("live.rs").unwrap());

        std::fs::write(repo.path().join("live.rs"), "fn second_version() {}\n").unwrap();
        assert!(indexer.reconcile_upsert("live.rs").unwrap());
        let hits = indexer.search("second_version", &SearchOptions::default()).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(indexer.search("first_version", &SearchOptions::default()).unwrap().is_empty());
    }

    #[test]
    fn test_reconcile_upsert_of_missing_path_deletes() {
        let (repo, _data, indexer) = fixture(&[("doomed.rs", "fn doomed() {}\n")]);
        indexer.index().unwrap();
        std::fs::remove_file(repo.path().join("doomed.rs")).unwrap();
        assert!(indexer.reconcile_upsert("doomed.rs").unwrap());
        assert_eq!(indexer.stats().unwrap().files, 0);
    }

    #[test]
    fn test_reconcile_delete_of_unknown_path_is_noop() {
        let (_repo, _data, indexer) = fixture(&[]);
        assert!(!indexer.reconcile_delete("never/indexed.rs").unwrap());
    }

    #[test]
    fn test_chunk_and_vector_state_after_build() {
        let (_repo, _data, indexer) =
            fixture(&[("math.rs", "fn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n")]);
        indexer.index().unwrap();

        // magnitudes and avg length are populated by the recompute pipeline
        let ids = indexer.store.chunk_ids_for_file("math.rs").unwrap();
        assert_eq!(ids.len(), 1);
        let candidates = indexer
            .store
            .search_by_terms(&["add".to_string()], 10, None)
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].magnitude > 0.0);
        assert!(candidates[0].token_count > 0);
        assert!(indexer.store.average_doc_length().unwrap() > 0.0);
    }
}
