//! SQLite-backed index store.
//!
//! Owns the durable tables (`files`, `chunks`, `document_vectors`,
//! `idf_scores`, `index_metadata`) and every write path into them. Bulk
//! writes are batched below SQLite's bind-variable ceiling; deletes cascade
//! through foreign keys. After any chunk mutation, callers run the four
//! global recomputations in order: IDF, TF-IDF, magnitudes, average length.

use rusqlite::functions::FunctionFlags;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use crate::error::Result;

/// Metadata key holding the corpus mean chunk token count.
pub const AVG_DOC_LENGTH_KEY: &str = "avgDocLength";

// ---------------------------------------------------------------------------
// Batch sizing, derived from the backend's bind-variable ceiling
// ---------------------------------------------------------------------------

/// SQLite's default `SQLITE_MAX_VARIABLE_NUMBER`.
const MAX_BOUND_PARAMS: usize = 999;

const FILE_COLS: usize = 7;
const CHUNK_COLS: usize = 6;
const VECTOR_COLS: usize = 5;
const IDF_COLS: usize = 3;

const FILE_BATCH: usize = MAX_BOUND_PARAMS / FILE_COLS;
const CHUNK_BATCH: usize = MAX_BOUND_PARAMS / CHUNK_COLS;
const VECTOR_BATCH: usize = MAX_BOUND_PARAMS / VECTOR_COLS;
const IDF_BATCH: usize = MAX_BOUND_PARAMS / IDF_COLS;

/// Keys per IN-list delete statement.
const DELETE_KEY_BATCH: usize = 500;

// ---------------------------------------------------------------------------
// Schema migrations (additive only)
// ---------------------------------------------------------------------------

const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    r#"
    CREATE TABLE files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT NOT NULL UNIQUE,
        content TEXT NOT NULL,
        hash INTEGER NOT NULL,
        size INTEGER NOT NULL,
        mtime INTEGER NOT NULL,
        language TEXT,
        indexed_at INTEGER NOT NULL
    );

    CREATE TABLE chunks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
        content TEXT NOT NULL,
        kind TEXT NOT NULL,
        start_line INTEGER NOT NULL,
        end_line INTEGER NOT NULL,
        metadata TEXT,
        token_count INTEGER NOT NULL DEFAULT 0,
        magnitude REAL NOT NULL DEFAULT 0
    );

    CREATE TABLE document_vectors (
        chunk_id INTEGER NOT NULL REFERENCES chunks(id) ON DELETE CASCADE,
        term TEXT NOT NULL,
        tf REAL NOT NULL,
        tfidf REAL NOT NULL,
        raw_freq INTEGER NOT NULL,
        PRIMARY KEY (chunk_id, term)
    );

    CREATE TABLE idf_scores (
        term TEXT PRIMARY KEY,
        idf REAL NOT NULL,
        doc_freq INTEGER NOT NULL
    );

    CREATE TABLE index_metadata (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE INDEX idx_chunks_file_id ON chunks(file_id);
    CREATE INDEX idx_vectors_chunk_id ON document_vectors(chunk_id);
    CREATE INDEX idx_vectors_term ON document_vectors(term);
    "#,
)];

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Upsert payload for a file row.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub path: String,
    pub content: String,
    pub hash: u32,
    pub size: u64,
    pub mtime: i64,
    pub language: Option<String>,
    pub indexed_at: i64,
}

/// Stored file metadata, as the diff engine sees it.
#[derive(Debug, Clone)]
pub struct StoredFileMeta {
    pub path: String,
    pub mtime: i64,
    pub hash: u32,
    pub size: u64,
}

/// Insert payload for one chunk row. `token_count` and `magnitude` start at
/// zero and are filled by the vector write and magnitude recomputation.
#[derive(Debug, Clone)]
pub struct ChunkInsert {
    pub content: String,
    pub kind: String,
    pub start_line: u32,
    pub end_line: u32,
    pub metadata_json: String,
}

/// Vector write payload for one chunk: raw term frequencies plus the total
/// token count of the chunk.
#[derive(Debug, Clone)]
pub struct ChunkVectors {
    pub chunk_id: i64,
    pub token_count: u32,
    pub term_freqs: Vec<(String, u32)>,
}

/// Per-term statistics attached to a search candidate.
#[derive(Debug, Clone, Copy)]
pub struct TermStats {
    pub tfidf: f64,
    pub raw_freq: u32,
}

/// A candidate chunk returned by [`IndexStore::search_by_terms`], carrying
/// its owning file and the pre-computed scoring inputs.
#[derive(Debug, Clone)]
pub struct CandidateChunk {
    pub chunk_id: i64,
    pub path: String,
    pub language: Option<String>,
    pub content: String,
    pub kind: String,
    pub start_line: u32,
    pub end_line: u32,
    pub token_count: u32,
    pub magnitude: f64,
    /// Populated only for query terms present in this chunk.
    pub matched_terms: HashMap<String, TermStats>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Durable relational store. Single writer by construction: every operation
/// takes the connection mutex for its full duration.
pub struct IndexStore {
    conn: Mutex<Connection>,
}

impl IndexStore {
    /// Open (or create) the store at `path`, apply pending migrations, and
    /// configure WAL journaling with enforced foreign keys.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        // The single-statement magnitude update needs sqrt(); registering it
        // here keeps the statement portable across builds where the math
        // functions are compiled out.
        conn.create_scalar_function(
            "sqrt",
            1,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| Ok(ctx.get::<f64>(0)?.sqrt()),
        )?;

        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )",
        )?;
        let applied: i64 = tx
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |r| {
                r.get(0)
            })?;
        for (version, sql) in MIGRATIONS {
            if *version > applied {
                tx.execute_batch(sql)?;
                tx.execute(
                    "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                    (version, now_ms()),
                )?;
                debug!(version, "applied store migration");
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // -----------------------------------------------------------------------
    // File rows
    // -----------------------------------------------------------------------

    /// Upsert file rows by path. Each batch commits atomically.
    pub fn store_files(&self, files: &[FileRecord]) -> Result<()> {
        let mut conn = self.lock();
        for batch in files.chunks(FILE_BATCH) {
            let tx = conn.transaction()?;
            {
                let placeholders = repeat_rows(batch.len(), FILE_COLS);
                let sql = format!(
                    "INSERT INTO files (path, content, hash, size, mtime, language, indexed_at)
                     VALUES {placeholders}
                     ON CONFLICT(path) DO UPDATE SET
                        content = excluded.content,
                        hash = excluded.hash,
                        size = excluded.size,
                        mtime = excluded.mtime,
                        language = excluded.language,
                        indexed_at = excluded.indexed_at"
                );
                let mut stmt = tx.prepare(&sql)?;
                let mut values: Vec<rusqlite::types::Value> =
                    Vec::with_capacity(batch.len() * FILE_COLS);
                for f in batch {
                    values.push(f.path.clone().into());
                    values.push(f.content.clone().into());
                    values.push((f.hash as i64).into());
                    values.push((f.size as i64).into());
                    values.push(f.mtime.into());
                    values.push(match &f.language {
                        Some(l) => l.clone().into(),
                        None => rusqlite::types::Value::Null,
                    });
                    values.push(f.indexed_at.into());
                }
                stmt.execute(params_from_iter(values))?;
            }
            tx.commit()?;
        }
        Ok(())
    }

    /// All stored file metadata, keyed for diffing against the filesystem.
    pub fn all_file_meta(&self) -> Result<Vec<StoredFileMeta>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT path, mtime, hash, size FROM files")?;
        let rows = stmt.query_map([], |r| {
            Ok(StoredFileMeta {
                path: r.get(0)?,
                mtime: r.get(1)?,
                hash: r.get::<_, i64>(2)? as u32,
                size: r.get::<_, i64>(3)? as u64,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn file_meta(&self, path: &str) -> Result<Option<StoredFileMeta>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT path, mtime, hash, size FROM files WHERE path = ?1",
            [path],
            |r| {
                Ok(StoredFileMeta {
                    path: r.get(0)?,
                    mtime: r.get(1)?,
                    hash: r.get::<_, i64>(2)? as u32,
                    size: r.get::<_, i64>(3)? as u64,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn file_content(&self, path: &str) -> Result<Option<String>> {
        let conn = self.lock();
        conn.query_row("SELECT content FROM files WHERE path = ?1", [path], |r| r.get(0))
            .optional()
            .map_err(Into::into)
    }

    /// Refresh only the stored mtime: the hash-skip path, where content is
    /// unchanged and chunk rows must not move.
    pub fn touch_file_mtime(&self, path: &str, mtime: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute("UPDATE files SET mtime = ?1 WHERE path = ?2", (mtime, path))?;
        Ok(())
    }

    /// Every indexed file's content, for the in-memory query mode.
    pub fn all_file_contents(&self) -> Result<Vec<(String, String, Option<String>)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT path, content, language FROM files")?;
        let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Cascading batched delete of files by path; chunks and vectors follow
    /// through the foreign keys. Returns the number of file rows removed.
    pub fn delete_files(&self, paths: &[String]) -> Result<usize> {
        if paths.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut deleted = 0;
        for batch in paths.chunks(DELETE_KEY_BATCH) {
            let placeholders = repeat_params(batch.len());
            let sql = format!("DELETE FROM files WHERE path IN ({placeholders})");
            deleted += tx.execute(&sql, params_from_iter(batch.iter()))?;
        }
        tx.commit()?;
        Ok(deleted)
    }

    // -----------------------------------------------------------------------
    // Chunk rows
    // -----------------------------------------------------------------------

    /// Replace the chunk set of each given file: delete-then-insert inside a
    /// single transaction. Returned id lists preserve input chunk order.
    pub fn store_many_chunks(
        &self,
        file_chunks: &[(String, Vec<ChunkInsert>)],
    ) -> Result<HashMap<String, Vec<i64>>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut ids_by_path: HashMap<String, Vec<i64>> = HashMap::new();

        for (path, chunks) in file_chunks {
            let file_id: i64 =
                tx.query_row("SELECT id FROM files WHERE path = ?1", [path], |r| r.get(0))?;
            tx.execute("DELETE FROM chunks WHERE file_id = ?1", [file_id])?;

            let mut ids: Vec<i64> = Vec::with_capacity(chunks.len());
            for batch in chunks.chunks(CHUNK_BATCH) {
                let placeholders = repeat_rows(batch.len(), CHUNK_COLS);
                let sql = format!(
                    "INSERT INTO chunks (file_id, content, kind, start_line, end_line, metadata)
                     VALUES {placeholders}"
                );
                let mut stmt = tx.prepare(&sql)?;
                let mut values: Vec<rusqlite::types::Value> =
                    Vec::with_capacity(batch.len() * CHUNK_COLS);
                for c in batch {
                    values.push(file_id.into());
                    values.push(c.content.clone().into());
                    values.push(c.kind.clone().into());
                    values.push((c.start_line as i64).into());
                    values.push((c.end_line as i64).into());
                    values.push(c.metadata_json.clone().into());
                }
                stmt.execute(params_from_iter(values))?;
                // rowids from one multi-row insert are consecutive under a
                // single writer; the last one is last_insert_rowid()
                let last = tx.last_insert_rowid();
                let first = last - batch.len() as i64 + 1;
                ids.extend(first..=last);
            }
            ids_by_path.insert(path.clone(), ids);
        }

        tx.commit()?;
        Ok(ids_by_path)
    }

    /// Chunk ids of a file in start-line order. Test and reconciliation aid.
    pub fn chunk_ids_for_file(&self, path: &str) -> Result<Vec<i64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT c.id FROM chunks c JOIN files f ON f.id = c.file_id
             WHERE f.path = ?1 ORDER BY c.start_line, c.id",
        )?;
        let rows = stmt.query_map([path], |r| r.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Vector rows
    // -----------------------------------------------------------------------

    /// Replace the vector rows of the given chunks and set each chunk's
    /// token count. `tfidf` is written as 0 here and finalized by
    /// [`IndexStore::recalculate_tfidf_scores`].
    pub fn store_many_chunk_vectors(&self, vectors: &[ChunkVectors]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let chunk_ids: Vec<i64> = vectors.iter().map(|v| v.chunk_id).collect();
        for batch in chunk_ids.chunks(DELETE_KEY_BATCH) {
            let placeholders = repeat_params(batch.len());
            let sql = format!("DELETE FROM document_vectors WHERE chunk_id IN ({placeholders})");
            tx.execute(&sql, params_from_iter(batch.iter()))?;
        }

        {
            let mut update = tx.prepare("UPDATE chunks SET token_count = ?1 WHERE id = ?2")?;
            for v in vectors {
                update.execute((v.token_count as i64, v.chunk_id))?;
            }
        }

        // flatten to rows, then batch below the bind limit
        let mut rows: Vec<(i64, &str, f64, u32)> = Vec::new();
        for v in vectors {
            let total: u32 = v.term_freqs.iter().map(|(_, n)| n).sum();
            for (term, raw) in &v.term_freqs {
                let tf = if total > 0 { *raw as f64 / total as f64 } else { 0.0 };
                rows.push((v.chunk_id, term, tf, *raw));
            }
        }
        for batch in rows.chunks(VECTOR_BATCH) {
            let placeholders = repeat_rows(batch.len(), VECTOR_COLS);
            let sql = format!(
                "INSERT INTO document_vectors (chunk_id, term, tf, tfidf, raw_freq)
                 VALUES {placeholders}"
            );
            let mut stmt = tx.prepare(&sql)?;
            let mut values: Vec<rusqlite::types::Value> =
                Vec::with_capacity(batch.len() * VECTOR_COLS);
            for (chunk_id, term, tf, raw) in batch {
                values.push((*chunk_id).into());
                values.push((*term).to_string().into());
                values.push((*tf).into());
                values.push(0.0f64.into());
                values.push((*raw as i64).into());
            }
            stmt.execute(params_from_iter(values))?;
        }

        tx.commit()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Global recomputations (run in order after any chunk mutation)
    // -----------------------------------------------------------------------

    /// Clear and rebuild `idf_scores` from the vector rows:
    /// `df = COUNT(DISTINCT chunk_id)` per term, `idf = ln((N+1)/(df+1)) + 1`
    /// with `N` = total chunk count.
    pub fn rebuild_idf_scores_from_vectors(&self) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM idf_scores", [])?;

        let total_chunks: i64 = tx.query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))?;
        let rows: Vec<(String, i64)> = {
            let mut stmt = tx.prepare(
                "SELECT term, COUNT(DISTINCT chunk_id) FROM document_vectors GROUP BY term",
            )?;
            let mapped = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
            let mut out = Vec::new();
            for row in mapped {
                out.push(row?);
            }
            out
        };

        for batch in rows.chunks(IDF_BATCH) {
            let placeholders = repeat_rows(batch.len(), IDF_COLS);
            let sql =
                format!("INSERT INTO idf_scores (term, idf, doc_freq) VALUES {placeholders}");
            let mut stmt = tx.prepare(&sql)?;
            let mut values: Vec<rusqlite::types::Value> =
                Vec::with_capacity(batch.len() * IDF_COLS);
            for (term, df) in batch {
                let idf = (((total_chunks + 1) as f64) / ((df + 1) as f64)).ln() + 1.0;
                values.push(term.clone().into());
                values.push(idf.into());
                values.push((*df).into());
            }
            stmt.execute(params_from_iter(values))?;
        }

        tx.commit()?;
        debug!(terms = rows.len(), chunks = total_chunks, "rebuilt idf scores");
        Ok(())
    }

    /// Single server-side update: `tfidf = tf × idf`, with idf coalesced to
    /// 0 for terms missing from `idf_scores`.
    pub fn recalculate_tfidf_scores(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE document_vectors SET tfidf = tf * COALESCE(
                (SELECT idf FROM idf_scores WHERE idf_scores.term = document_vectors.term), 0)",
            [],
        )?;
        Ok(())
    }

    /// Single server-side update: `magnitude = sqrt(Σ tfidf²)` per chunk,
    /// 0 for chunks with no vector rows.
    pub fn update_chunk_magnitudes(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE chunks SET magnitude = COALESCE(
                (SELECT sqrt(SUM(tfidf * tfidf)) FROM document_vectors
                 WHERE document_vectors.chunk_id = chunks.id), 0)",
            [],
        )?;
        Ok(())
    }

    /// Store `avg(token_count)` over chunks under the metadata key.
    pub fn update_average_doc_length(&self) -> Result<()> {
        let avg: f64 = {
            let conn = self.lock();
            conn.query_row(
                "SELECT COALESCE(AVG(COALESCE(token_count, 0)), 0) FROM chunks",
                [],
                |r| r.get(0),
            )?
        };
        self.set_metadata(AVG_DOC_LENGTH_KEY, &avg.to_string())
    }

    pub fn average_doc_length(&self) -> Result<f64> {
        Ok(self
            .get_metadata(AVG_DOC_LENGTH_KEY)?
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0))
    }

    // -----------------------------------------------------------------------
    // Metadata
    // -----------------------------------------------------------------------

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock();
        conn.query_row("SELECT value FROM index_metadata WHERE key = ?1", [key], |r| r.get(0))
            .optional()
            .map_err(Into::into)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO index_metadata (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            (key, value),
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Query support
    // -----------------------------------------------------------------------

    /// Candidate chunks containing any of the query terms, joined to their
    /// owning file with pre-computed magnitude and token count, ordered by
    /// distinct-term match count descending and capped at `cap`
    /// (`2 × limit` unless the caller overrides it).
    pub fn search_by_terms(
        &self,
        terms: &[String],
        limit: usize,
        cap: Option<usize>,
    ) -> Result<Vec<CandidateChunk>> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        // keep the IN list safely under the bind ceiling
        let terms: Vec<&String> = terms.iter().take(MAX_BOUND_PARAMS / 2).collect();
        let cap = cap.unwrap_or(limit.saturating_mul(2)).max(1);

        let conn = self.lock();
        let placeholders = repeat_params(terms.len());
        let sql = format!(
            "SELECT c.id, f.path, f.language, c.content, c.kind, c.start_line, c.end_line,
                    c.token_count, c.magnitude,
                    COUNT(DISTINCT dv.term) AS matched
             FROM document_vectors dv
             JOIN chunks c ON c.id = dv.chunk_id
             JOIN files f ON f.id = c.file_id
             WHERE dv.term IN ({placeholders})
             GROUP BY c.id
             ORDER BY matched DESC, c.id ASC
             LIMIT {cap}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(terms.iter()), |r| {
            Ok(CandidateChunk {
                chunk_id: r.get(0)?,
                path: r.get(1)?,
                language: r.get(2)?,
                content: r.get(3)?,
                kind: r.get(4)?,
                start_line: r.get::<_, i64>(5)? as u32,
                end_line: r.get::<_, i64>(6)? as u32,
                token_count: r.get::<_, i64>(7)? as u32,
                magnitude: r.get(8)?,
                matched_terms: HashMap::new(),
            })
        })?;
        let mut candidates = Vec::new();
        for row in rows {
            candidates.push(row?);
        }
        if candidates.is_empty() {
            return Ok(candidates);
        }

        // second pass: per-candidate stats for the query terms only
        let ids: Vec<i64> = candidates.iter().map(|c| c.chunk_id).collect();
        let id_ph = repeat_params(ids.len());
        let term_ph = repeat_params(terms.len());
        let sql = format!(
            "SELECT chunk_id, term, tfidf, raw_freq FROM document_vectors
             WHERE chunk_id IN ({id_ph}) AND term IN ({term_ph})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut values: Vec<rusqlite::types::Value> = Vec::with_capacity(ids.len() + terms.len());
        for id in &ids {
            values.push((*id).into());
        }
        for term in &terms {
            values.push((*term).clone().into());
        }
        let rows = stmt.query_map(params_from_iter(values), |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, f64>(2)?,
                r.get::<_, i64>(3)? as u32,
            ))
        })?;
        let by_id: HashMap<i64, usize> =
            candidates.iter().enumerate().map(|(i, c)| (c.chunk_id, i)).collect();
        for row in rows {
            let (chunk_id, term, tfidf, raw_freq) = row?;
            if let Some(&i) = by_id.get(&chunk_id) {
                candidates[i].matched_terms.insert(term, TermStats { tfidf, raw_freq });
            }
        }
        Ok(candidates)
    }

    /// Locate a chunk by its file path and line range, the reverse mapping
    /// of the vector-document id. Matched terms are left empty.
    pub fn chunk_by_location(
        &self,
        path: &str,
        start_line: u32,
        end_line: u32,
    ) -> Result<Option<CandidateChunk>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT c.id, f.path, f.language, c.content, c.kind, c.start_line, c.end_line,
                    c.token_count, c.magnitude
             FROM chunks c JOIN files f ON f.id = c.file_id
             WHERE f.path = ?1 AND c.start_line = ?2 AND c.end_line = ?3",
            (path, start_line as i64, end_line as i64),
            |r| {
                Ok(CandidateChunk {
                    chunk_id: r.get(0)?,
                    path: r.get(1)?,
                    language: r.get(2)?,
                    content: r.get(3)?,
                    kind: r.get(4)?,
                    start_line: r.get::<_, i64>(5)? as u32,
                    end_line: r.get::<_, i64>(6)? as u32,
                    token_count: r.get::<_, i64>(7)? as u32,
                    magnitude: r.get(8)?,
                    matched_terms: HashMap::new(),
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    /// IDF scores for the given terms; absent terms are simply missing from
    /// the map (idf 0 at query time).
    pub fn idf_for_terms(&self, terms: &[String]) -> Result<HashMap<String, f64>> {
        if terms.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.lock();
        let placeholders = repeat_params(terms.len());
        let sql = format!("SELECT term, idf FROM idf_scores WHERE term IN ({placeholders})");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(terms.iter()), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (term, idf) = row?;
            out.insert(term, idf);
        }
        Ok(out)
    }

    /// Distinct terms appearing in chunks of the given files.
    pub fn terms_for_files(&self, paths: &[String]) -> Result<HashSet<String>> {
        if paths.is_empty() {
            return Ok(HashSet::new());
        }
        let conn = self.lock();
        let mut out = HashSet::new();
        for batch in paths.chunks(DELETE_KEY_BATCH) {
            let placeholders = repeat_params(batch.len());
            let sql = format!(
                "SELECT DISTINCT dv.term
                 FROM document_vectors dv
                 JOIN chunks c ON c.id = dv.chunk_id
                 JOIN files f ON f.id = c.file_id
                 WHERE f.path IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(batch.iter()), |r| r.get::<_, String>(0))?;
            for row in rows {
                out.insert(row?);
            }
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Counters & maintenance
    // -----------------------------------------------------------------------

    pub fn file_count(&self) -> Result<u64> {
        let conn = self.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM files", [], |r| r.get::<_, i64>(0))? as u64)
    }

    pub fn chunk_count(&self) -> Result<u64> {
        let conn = self.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get::<_, i64>(0))? as u64)
    }

    pub fn term_count(&self) -> Result<u64> {
        let conn = self.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM idf_scores", [], |r| r.get::<_, i64>(0))? as u64)
    }

    /// Drop every row; the schema and migration registry stay.
    pub fn clear(&self) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM files", [])?;
        tx.execute("DELETE FROM idf_scores", [])?;
        tx.execute("DELETE FROM index_metadata", [])?;
        tx.commit()?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn vector_rows_for_chunk(&self, chunk_id: i64) -> Result<Vec<(String, f64, f64, u32)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT term, tf, tfidf, raw_freq FROM document_vectors
             WHERE chunk_id = ?1 ORDER BY term",
        )?;
        let rows = stmt.query_map([chunk_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get::<_, i64>(3)? as u32))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    #[cfg(test)]
    pub(crate) fn chunk_magnitude(&self, chunk_id: i64) -> Result<f64> {
        let conn = self.lock();
        conn.query_row("SELECT magnitude FROM chunks WHERE id = ?1", [chunk_id], |r| r.get(0))
            .map_err(Into::into)
    }

    #[cfg(test)]
    pub(crate) fn idf_row(&self, term: &str) -> Result<Option<(f64, i64)>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT idf, doc_freq FROM idf_scores WHERE term = ?1",
            [term],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(Into::into)
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// `(?, ?, ...)` repeated `rows` times with `cols` params each.
fn repeat_rows(rows: usize, cols: usize) -> String {
    let row = format!("({})", repeat_params(cols));
    let mut out = String::with_capacity(rows * (row.len() + 2));
    for i in 0..rows {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&row);
    }
    out
}

fn repeat_params(n: usize) -> String {
    let mut out = String::with_capacity(n * 3);
    for i in 0..n {
        if i > 0 {
            out.push_str(", ");
        }
        out.push('?');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, content: &str) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            content: content.to_string(),
            hash: 1,
            size: content.len() as u64,
            mtime: 1000,
            language: Some("rust".to_string()),
            indexed_at: 2000,
        }
    }

    fn chunk(content: &str) -> ChunkInsert {
        ChunkInsert {
            content: content.to_string(),
            kind: "function_item".to_string(),
            start_line: 1,
            end_line: 1,
            metadata_json: "{}".to_string(),
        }
    }

    /// Index one file with one chunk whose terms are given as (term, raw).
    fn seed(store: &IndexStore, path: &str, terms: &[(&str, u32)]) -> i64 {
        store.store_files(&[file(path, "content")]).unwrap();
        let ids = store
            .store_many_chunks(&[(path.to_string(), vec![chunk("content")])])
            .unwrap();
        let chunk_id = ids[path][0];
        let token_count: u32 = terms.iter().map(|(_, n)| n).sum();
        store
            .store_many_chunk_vectors(&[ChunkVectors {
                chunk_id,
                token_count,
                term_freqs: terms.iter().map(|(t, n)| (t.to_string(), *n)).collect(),
            }])
            .unwrap();
        chunk_id
    }

    fn recompute(store: &IndexStore) {
        store.rebuild_idf_scores_from_vectors().unwrap();
        store.recalculate_tfidf_scores().unwrap();
        store.update_chunk_magnitudes().unwrap();
        store.update_average_doc_length().unwrap();
    }

    #[test]
    fn test_idf_smoothing_exact() {
        let store = IndexStore::open_in_memory().unwrap();
        seed(&store, "a.rs", &[("hello", 1)]);
        seed(&store, "b.rs", &[("hello", 1)]);
        recompute(&store);
        // df = 2, N = 2: idf = ln(3/3) + 1 = 1.0 exactly
        let (idf, df) = store.idf_row("hello").unwrap().unwrap();
        assert_eq!(df, 2);
        assert_eq!(idf, 1.0);
    }

    #[test]
    fn test_tf_normalization_and_tfidf() {
        let store = IndexStore::open_in_memory().unwrap();
        let id = seed(&store, "a.rs", &[("alpha", 3), ("beta", 1)]);
        recompute(&store);
        let rows = store.vector_rows_for_chunk(id).unwrap();
        let alpha = rows.iter().find(|r| r.0 == "alpha").unwrap();
        let beta = rows.iter().find(|r| r.0 == "beta").unwrap();
        assert!((alpha.1 - 0.75).abs() < 1e-12);
        assert!((beta.1 - 0.25).abs() < 1e-12);
        // N = 1, df = 1: idf = ln(2/2) + 1 = 1.0, so tfidf == tf
        assert!((alpha.2 - 0.75).abs() < 1e-12);
        assert_eq!(alpha.3, 3);
    }

    #[test]
    fn test_magnitude_matches_vector_rows() {
        let store = IndexStore::open_in_memory().unwrap();
        let id = seed(&store, "a.rs", &[("alpha", 2), ("beta", 1), ("gamma", 1)]);
        seed(&store, "b.rs", &[("alpha", 1)]);
        recompute(&store);
        let rows = store.vector_rows_for_chunk(id).unwrap();
        let expect: f64 = rows.iter().map(|r| r.2 * r.2).sum::<f64>().sqrt();
        let got = store.chunk_magnitude(id).unwrap();
        assert!((got - expect).abs() < 1e-10, "magnitude {got} vs {expect}");
    }

    #[test]
    fn test_avg_doc_length() {
        let store = IndexStore::open_in_memory().unwrap();
        seed(&store, "a.rs", &[("x", 4)]); // token_count 4
        seed(&store, "b.rs", &[("y", 2)]); // token_count 2
        recompute(&store);
        assert!((store.average_doc_length().unwrap() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_delete_cascades_to_chunks_and_vectors() {
        let store = IndexStore::open_in_memory().unwrap();
        let id = seed(&store, "a.rs", &[("alpha", 1)]);
        recompute(&store);
        assert_eq!(store.chunk_count().unwrap(), 1);
        store.delete_files(&["a.rs".to_string()]).unwrap();
        assert_eq!(store.file_count().unwrap(), 0);
        assert_eq!(store.chunk_count().unwrap(), 0);
        assert!(store.vector_rows_for_chunk(id).unwrap().is_empty());
    }

    #[test]
    fn test_chunk_replacement_preserves_order_and_atomicity() {
        let store = IndexStore::open_in_memory().unwrap();
        store.store_files(&[file("a.rs", "x")]).unwrap();
        let first = store
            .store_many_chunks(&[("a.rs".to_string(), vec![chunk("one"), chunk("two")])])
            .unwrap();
        assert_eq!(first["a.rs"].len(), 2);
        assert!(first["a.rs"][0] < first["a.rs"][1], "ids preserve input order");

        let second = store
            .store_many_chunks(&[("a.rs".to_string(), vec![chunk("three")])])
            .unwrap();
        assert_eq!(second["a.rs"].len(), 1);
        assert_eq!(store.chunk_count().unwrap(), 1, "old set fully replaced");
    }

    #[test]
    fn test_batched_insert_crosses_bind_limit() {
        let store = IndexStore::open_in_memory().unwrap();
        store.store_files(&[file("big.rs", "x")]).unwrap();
        let n = CHUNK_BATCH * 2 + 7;
        let chunks: Vec<ChunkInsert> = (0..n).map(|i| chunk(&format!("chunk {i}"))).collect();
        let ids = store
            .store_many_chunks(&[("big.rs".to_string(), chunks)])
            .unwrap();
        assert_eq!(ids["big.rs"].len(), n);
        assert_eq!(store.chunk_count().unwrap(), n as u64);
        // order is preserved across batch boundaries
        let sorted: Vec<i64> = {
            let mut v = ids["big.rs"].clone();
            v.sort_unstable();
            v
        };
        assert_eq!(ids["big.rs"], sorted);
    }

    #[test]
    fn test_search_by_terms_candidates() {
        let store = IndexStore::open_in_memory().unwrap();
        seed(&store, "a.rs", &[("alpha", 2), ("beta", 1)]);
        seed(&store, "b.rs", &[("alpha", 1)]);
        seed(&store, "c.rs", &[("gamma", 1)]);
        recompute(&store);

        let terms = vec!["alpha".to_string(), "beta".to_string()];
        let candidates = store.search_by_terms(&terms, 10, None).unwrap();
        assert_eq!(candidates.len(), 2);
        // a.rs matches both terms, so it sorts first
        assert_eq!(candidates[0].path, "a.rs");
        assert_eq!(candidates[0].matched_terms.len(), 2);
        assert_eq!(candidates[0].matched_terms["alpha"].raw_freq, 2);
        assert!(candidates[0].magnitude > 0.0);
        assert_eq!(candidates[1].path, "b.rs");
        assert_eq!(candidates[1].matched_terms.len(), 1);
    }

    #[test]
    fn test_search_by_terms_cap() {
        let store = IndexStore::open_in_memory().unwrap();
        for i in 0..10 {
            seed(&store, &format!("f{i}.rs"), &[("common", 1)]);
        }
        recompute(&store);
        let hits = store
            .search_by_terms(&["common".to_string()], 3, None)
            .unwrap();
        assert_eq!(hits.len(), 6, "candidate set capped at 2 × limit");
    }

    #[test]
    fn test_search_no_terms_or_no_match() {
        let store = IndexStore::open_in_memory().unwrap();
        seed(&store, "a.rs", &[("alpha", 1)]);
        recompute(&store);
        assert!(store.search_by_terms(&[], 10, None).unwrap().is_empty());
        assert!(store
            .search_by_terms(&["zzznope".to_string()], 10, None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_terms_for_files() {
        let store = IndexStore::open_in_memory().unwrap();
        seed(&store, "a.rs", &[("alpha", 1), ("beta", 1)]);
        seed(&store, "b.rs", &[("gamma", 1)]);
        let terms = store.terms_for_files(&["a.rs".to_string()]).unwrap();
        assert_eq!(terms.len(), 2);
        assert!(terms.contains("alpha") && terms.contains("beta"));
    }

    #[test]
    fn test_touch_mtime_leaves_chunks_alone() {
        let store = IndexStore::open_in_memory().unwrap();
        seed(&store, "a.rs", &[("alpha", 1)]);
        let before = store.chunk_ids_for_file("a.rs").unwrap();
        store.touch_file_mtime("a.rs", 99_999).unwrap();
        let after = store.chunk_ids_for_file("a.rs").unwrap();
        assert_eq!(before, after);
        assert_eq!(store.file_meta("a.rs").unwrap().unwrap().mtime, 99_999);
    }

    #[test]
    fn test_metadata_roundtrip() {
        let store = IndexStore::open_in_memory().unwrap();
        assert!(store.get_metadata("k").unwrap().is_none());
        store.set_metadata("k", "v1").unwrap();
        store.set_metadata("k", "v2").unwrap();
        assert_eq!(store.get_metadata("k").unwrap().as_deref(), Some("v2"));
    }

    #[test]
    fn test_migrations_idempotent_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        {
            let store = IndexStore::open(&path).unwrap();
            seed(&store, "a.rs", &[("alpha", 1)]);
        }
        let store = IndexStore::open(&path).unwrap();
        assert_eq!(store.file_count().unwrap(), 1);
    }

    #[test]
    fn test_clear_drops_everything() {
        let store = IndexStore::open_in_memory().unwrap();
        seed(&store, "a.rs", &[("alpha", 1)]);
        recompute(&store);
        store.clear().unwrap();
        assert_eq!(store.file_count().unwrap(), 0);
        assert_eq!(store.chunk_count().unwrap(), 0);
        assert_eq!(store.term_count().unwrap(), 0);
        assert!(store.get_metadata(AVG_DOC_LENGTH_KEY).unwrap().is_none());
    }
}
