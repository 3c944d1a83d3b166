//! Query engine: BM25 over store candidates, optional hybrid fusion with an
//! ANN store, filtering, snippets, and the in-memory file-level mode.
//!
//! A query flows cache → tokenize → candidate fetch → scoring → optional
//! vector fetch + fusion → snippet build. ANN failure degrades to pure BM25
//! with a logged warning; a store failure fails the whole query.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

use crate::cache::{QueryResultCache, QueryTokenCache};
use crate::error::Result;
use crate::store::{CandidateChunk, IndexStore};
use crate::tokenizer::CodeTokenizer;
use crate::vector::{chunk_vector_id, EmbeddingProvider, VectorStore};

pub const BM25_K1: f64 = 1.2;
pub const BM25_B: f64 = 0.75;

/// Default weight of the vector component in hybrid fusion.
pub const DEFAULT_VECTOR_WEIGHT: f64 = 0.7;

/// Normalization floor guarding against zero maxima.
const NORM_FLOOR: f64 = 0.01;

// ---------------------------------------------------------------------------
// Options & results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub limit: usize,
    pub include_content: bool,
    /// Keep only files with one of these extensions (leading dot optional).
    pub file_extensions: Vec<String>,
    /// Keep only paths containing this substring.
    pub path_substring: Option<String>,
    /// Drop paths containing any of these substrings.
    pub exclude_path_substrings: Vec<String>,
    pub snippet_context_lines: usize,
    pub snippet_max_chars: usize,
    pub snippet_max_blocks: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            include_content: true,
            file_extensions: Vec::new(),
            path_substring: None,
            exclude_path_substrings: Vec::new(),
            snippet_context_lines: 3,
            snippet_max_chars: 2000,
            snippet_max_blocks: 4,
        }
    }
}

/// Which ranking produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreMethod {
    Tfidf,
    Vector,
    Hybrid,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub path: String,
    pub language: Option<String>,
    pub kind: String,
    pub start_line: u32,
    pub end_line: u32,
    pub score: f64,
    pub method: ScoreMethod,
    pub matched_terms: Vec<String>,
    pub snippet: Option<String>,
}

/// Stable cache key: lowercased trimmed query | limit | sorted extensions |
/// path substring | sorted excludes.
pub fn cache_key(query: &str, opts: &SearchOptions) -> String {
    let mut exts = opts.file_extensions.clone();
    exts.sort();
    let mut excludes = opts.exclude_path_substrings.clone();
    excludes.sort();
    format!(
        "{}|{}|{}|{}|{}",
        query.trim().to_lowercase(),
        opts.limit,
        exts.join(","),
        opts.path_substring.as_deref().unwrap_or(""),
        excludes.join(",")
    )
}

// ---------------------------------------------------------------------------
// BM25
// ---------------------------------------------------------------------------

/// BM25 over the terms a chunk actually matched.
/// `matched` pairs each term's idf with its raw in-chunk frequency.
pub fn bm25_score(matched: &[(f64, u32)], doc_len: u32, avgdl: f64) -> f64 {
    let doc_len = doc_len.max(1) as f64;
    let avgdl = avgdl.max(1.0);
    matched
        .iter()
        .map(|(idf, raw)| {
            let f = *raw as f64;
            idf * (f * (BM25_K1 + 1.0)) / (f + BM25_K1 * (1.0 - BM25_B + BM25_B * doc_len / avgdl))
        })
        .sum()
}

fn passes_filters(path: &str, opts: &SearchOptions) -> bool {
    if let Some(substr) = &opts.path_substring {
        if !path.contains(substr.as_str()) {
            return false;
        }
    }
    if opts.exclude_path_substrings.iter().any(|s| path.contains(s.as_str())) {
        return false;
    }
    if !opts.file_extensions.is_empty() {
        let ext = path.rsplit('.').next().unwrap_or("");
        return opts
            .file_extensions
            .iter()
            .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(ext));
    }
    true
}

/// Deterministic result ordering: score descending, then path and start
/// line ascending.
fn sort_results(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.start_line.cmp(&b.start_line))
    });
}

/// Chunk-mode snippet: the chunk verbatim, each line prefixed with its
/// absolute line number.
fn numbered_snippet(content: &str, start_line: u32) -> String {
    content
        .lines()
        .enumerate()
        .map(|(i, line)| format!("{} | {}", start_line as usize + i, line))
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct QueryEngine {
    store: Arc<IndexStore>,
    tokenizer: Arc<CodeTokenizer>,
    result_cache: Arc<QueryResultCache<Vec<SearchResult>>>,
    token_cache: Arc<QueryTokenCache>,
    vector_store: Option<Arc<dyn VectorStore>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    vector_weight: f64,
}

impl QueryEngine {
    pub fn new(
        store: Arc<IndexStore>,
        tokenizer: Arc<CodeTokenizer>,
        result_cache: Arc<QueryResultCache<Vec<SearchResult>>>,
        token_cache: Arc<QueryTokenCache>,
    ) -> Self {
        Self {
            store,
            tokenizer,
            result_cache,
            token_cache,
            vector_store: None,
            embedder: None,
            vector_weight: DEFAULT_VECTOR_WEIGHT,
        }
    }

    pub fn with_vector_store(
        mut self,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        self.vector_store = Some(store);
        self.embedder = Some(embedder);
        self
    }

    pub fn vector_weight(mut self, weight: f64) -> Self {
        self.vector_weight = weight.clamp(0.0, 1.0);
        self
    }

    /// Deduplicated query terms, via the token cache.
    fn query_terms(&self, query: &str) -> Vec<String> {
        if let Some(cached) = self.token_cache.get(query) {
            return cached;
        }
        let mut seen = HashSet::new();
        let terms: Vec<String> = self
            .tokenizer
            .tokenize(query)
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .collect();
        self.token_cache.set(query.to_string(), terms.clone());
        terms
    }

    /// Chunk-mode search against the persistent store.
    pub fn search(&self, query: &str, opts: &SearchOptions) -> Result<Vec<SearchResult>> {
        let key = cache_key(query, opts);
        if let Some(hit) = self.result_cache.get(&key) {
            return Ok(hit);
        }

        let terms = self.query_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let hybrid = self.vector_store.is_some() && self.embedder.is_some();
        let skip_bm25 = hybrid && self.vector_weight >= 0.99;
        let skip_vector = !hybrid || self.vector_weight <= 0.01;

        // BM25 and ANN legs run concurrently when both are needed.
        let (bm25, ann) = rayon::join(
            || -> Result<Vec<SearchResult>> {
                if skip_bm25 {
                    Ok(Vec::new())
                } else {
                    self.bm25_leg(&terms, opts)
                }
            },
            || {
                if skip_vector {
                    None
                } else {
                    self.vector_leg(query, opts)
                }
            },
        );
        let bm25 = bm25?;

        let mut results = match ann {
            Some(ann) if !ann.is_empty() || skip_bm25 => {
                self.fuse(bm25, ann, opts)
            }
            // adapter unavailable or empty: pure BM25
            _ => bm25,
        };

        sort_results(&mut results);
        results.truncate(opts.limit);
        if !opts.include_content {
            for r in &mut results {
                r.snippet = None;
            }
        }

        self.result_cache.set(key, results.clone());
        Ok(results)
    }

    /// Candidate fetch + rescoring. Returns up to `2 × limit` scored results.
    fn bm25_leg(&self, terms: &[String], opts: &SearchOptions) -> Result<Vec<SearchResult>> {
        let candidates = self.store.search_by_terms(terms, opts.limit, None)?;
        let idf = self.store.idf_for_terms(terms)?;
        let avgdl = self.store.average_doc_length()?;

        let mut results = Vec::with_capacity(candidates.len());
        for cand in candidates {
            if !passes_filters(&cand.path, opts) {
                continue;
            }
            let matched: Vec<(f64, u32)> = terms
                .iter()
                .filter_map(|t| {
                    let stats = cand.matched_terms.get(t)?;
                    Some((idf.get(t).copied().unwrap_or(0.0), stats.raw_freq))
                })
                .collect();
            if matched.is_empty() {
                continue;
            }
            let score = bm25_score(&matched, cand.token_count, avgdl);
            results.push(chunk_result(&cand, score, ScoreMethod::Tfidf, terms));
        }
        sort_results(&mut results);
        results.truncate(opts.limit.saturating_mul(2));
        Ok(results)
    }

    /// ANN leg: embed the query and fetch top `2 × limit` neighbours.
    /// `None` means the vector path is unavailable and fusion is skipped.
    fn vector_leg(&self, query: &str, opts: &SearchOptions) -> Option<Vec<(String, f64)>> {
        let embedder = self.embedder.as_ref()?;
        let vectors = self.vector_store.as_ref()?;
        let embedding = match embedder.embed(&[query.to_string()]) {
            Ok(mut batch) if !batch.is_empty() => batch.remove(0),
            Ok(_) => return Some(Vec::new()),
            Err(e) => {
                warn!(error = %e, "query embedding failed, falling back to BM25");
                return None;
            }
        };
        match vectors.search(&embedding, opts.limit.saturating_mul(2)) {
            Ok(hits) => {
                Some(hits.into_iter().map(|h| (h.id, h.similarity as f64)).collect())
            }
            Err(e) => {
                warn!(error = %e, "vector search failed, falling back to BM25");
                None
            }
        }
    }

    /// Weighted fusion of the two legs, each normalized by its own maximum.
    fn fuse(
        &self,
        bm25: Vec<SearchResult>,
        ann: Vec<(String, f64)>,
        opts: &SearchOptions,
    ) -> Vec<SearchResult> {
        let w = self.vector_weight;
        let bm25_max = bm25.iter().map(|r| r.score).fold(0.0f64, f64::max).max(NORM_FLOOR);
        let ann_max = ann.iter().map(|(_, s)| *s).fold(0.0f64, f64::max).max(NORM_FLOOR);

        let mut fused: HashMap<String, SearchResult> = HashMap::new();
        for r in bm25 {
            let id = chunk_vector_id(&r.path, r.start_line, r.end_line);
            let norm = r.score / bm25_max;
            fused.insert(
                id,
                SearchResult { score: (1.0 - w) * norm, method: ScoreMethod::Tfidf, ..r },
            );
        }
        for (id, sim) in ann {
            let norm = sim / ann_max;
            match fused.get_mut(&id) {
                Some(existing) => {
                    existing.score += w * norm;
                    existing.method = ScoreMethod::Hybrid;
                }
                None => {
                    // vector-only hit: hydrate from the relational store,
                    // dropping stale documents with no current chunk
                    if let Some(result) = self.hydrate_vector_hit(&id, w * norm, opts) {
                        fused.insert(id, result);
                    }
                }
            }
        }
        fused.into_values().collect()
    }

    fn hydrate_vector_hit(
        &self,
        id: &str,
        score: f64,
        opts: &SearchOptions,
    ) -> Option<SearchResult> {
        let (path, start_line, end_line) = parse_chunk_id(id)?;
        if !passes_filters(&path, opts) {
            return None;
        }
        let chunk = self.store.chunk_by_location(&path, start_line, end_line).ok()??;
        Some(chunk_result(&chunk, score, ScoreMethod::Vector, &[]))
    }
}

fn chunk_result(
    cand: &CandidateChunk,
    score: f64,
    method: ScoreMethod,
    query_terms: &[String],
) -> SearchResult {
    let mut matched: Vec<String> = query_terms
        .iter()
        .filter(|t| cand.matched_terms.contains_key(*t))
        .cloned()
        .collect();
    matched.sort();
    SearchResult {
        path: cand.path.clone(),
        language: cand.language.clone(),
        kind: cand.kind.clone(),
        start_line: cand.start_line,
        end_line: cand.end_line,
        score,
        method,
        matched_terms: matched,
        snippet: Some(numbered_snippet(&cand.content, cand.start_line)),
    }
}

/// Parse `chunk://<path>:<start>-<end>` back into its parts.
fn parse_chunk_id(id: &str) -> Option<(String, u32, u32)> {
    let rest = id.strip_prefix("chunk://")?;
    let (path, range) = rest.rsplit_once(':')?;
    let (start, end) = range.split_once('-')?;
    Some((path.to_string(), start.parse().ok()?, end.parse().ok()?))
}

// ---------------------------------------------------------------------------
// In-memory file-level mode
// ---------------------------------------------------------------------------

struct MemoryFile {
    path: String,
    language: Option<String>,
    content: String,
    term_freqs: HashMap<String, u32>,
    token_count: u32,
}

/// Whole-file index held in memory. Scores with the same BM25 formula, with
/// `avgdl` the mean document length across files, and builds block snippets
/// from file content.
pub struct MemoryIndex {
    files: Vec<MemoryFile>,
    avgdl: f64,
    idf: HashMap<String, f64>,
}

impl MemoryIndex {
    /// Build from every stored file's content.
    pub fn build(store: &IndexStore, tokenizer: &CodeTokenizer) -> Result<Self> {
        let mut files = Vec::new();
        for (path, content, language) in store.all_file_contents()? {
            let (term_freqs, token_count) = tokenizer.term_frequencies(&content);
            files.push(MemoryFile { path, language, content, term_freqs, token_count });
        }
        let n = files.len();
        let avgdl = if n == 0 {
            0.0
        } else {
            files.iter().map(|f| f.token_count as f64).sum::<f64>() / n as f64
        };
        let mut df: HashMap<&str, u32> = HashMap::new();
        for f in &files {
            for term in f.term_freqs.keys() {
                *df.entry(term.as_str()).or_insert(0) += 1;
            }
        }
        let idf = df
            .into_iter()
            .map(|(term, df)| {
                (term.to_string(), (((n + 1) as f64) / ((df + 1) as f64)).ln() + 1.0)
            })
            .collect();
        Ok(Self { files, avgdl, idf })
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn search(
        &self,
        tokenizer: &CodeTokenizer,
        query: &str,
        opts: &SearchOptions,
    ) -> Vec<SearchResult> {
        let mut seen = HashSet::new();
        let terms: Vec<String> = tokenizer
            .tokenize(query)
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .collect();
        if terms.is_empty() {
            return Vec::new();
        }

        let mut results = Vec::new();
        for file in &self.files {
            if !passes_filters(&file.path, opts) {
                continue;
            }
            let matched: Vec<(f64, u32)> = terms
                .iter()
                .filter_map(|t| {
                    let raw = *file.term_freqs.get(t)?;
                    Some((self.idf.get(t).copied().unwrap_or(0.0), raw))
                })
                .collect();
            if matched.is_empty() {
                continue;
            }
            let score = bm25_score(&matched, file.token_count, self.avgdl);
            let matched_terms: Vec<String> = {
                let mut m: Vec<String> = terms
                    .iter()
                    .filter(|t| file.term_freqs.contains_key(*t))
                    .cloned()
                    .collect();
                m.sort();
                m
            };
            let line_count = file.content.lines().count() as u32;
            results.push(SearchResult {
                path: file.path.clone(),
                language: file.language.clone(),
                kind: "file".to_string(),
                start_line: 1,
                end_line: line_count.max(1),
                score,
                method: ScoreMethod::Tfidf,
                matched_terms,
                snippet: if opts.include_content {
                    Some(compose_snippet(&file.content, &terms, opts))
                } else {
                    None
                },
            });
        }
        sort_results(&mut results);
        results.truncate(opts.limit);
        results
    }
}

// ---------------------------------------------------------------------------
// Block snippet composer (file-level results)
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Block {
    start: usize,
    end: usize, // inclusive line indexes (0-based)
    distinct_terms: usize,
    hits: usize,
}

/// Find matching lines, expand to ±context blocks, merge overlaps, rank by
/// (distinct matched terms desc, hit density desc), emit up to `max_blocks`
/// in file order separated by `\n...\n`, stopping at the char budget.
/// With no matching line, emit the first five lines.
pub fn compose_snippet(content: &str, terms: &[String], opts: &SearchOptions) -> String {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return String::new();
    }

    let lowered: Vec<String> = lines.iter().map(|l| l.to_lowercase()).collect();
    let matching: Vec<usize> = lowered
        .iter()
        .enumerate()
        .filter(|(_, line)| terms.iter().any(|t| line.contains(t.as_str())))
        .map(|(i, _)| i)
        .collect();

    if matching.is_empty() {
        return lines.iter().take(5).copied().collect::<Vec<_>>().join("\n");
    }

    // expand and merge
    let ctx = opts.snippet_context_lines;
    let mut blocks: Vec<Block> = Vec::new();
    for &i in &matching {
        let start = i.saturating_sub(ctx);
        let end = (i + ctx).min(lines.len() - 1);
        match blocks.last_mut() {
            Some(last) if start <= last.end + 1 => last.end = last.end.max(end),
            _ => blocks.push(Block { start, end, distinct_terms: 0, hits: 0 }),
        }
    }
    for block in &mut blocks {
        let mut distinct = HashSet::new();
        for line in &lowered[block.start..=block.end] {
            for t in terms {
                let hits = line.matches(t.as_str()).count();
                if hits > 0 {
                    distinct.insert(t.as_str());
                    block.hits += hits;
                }
            }
        }
        block.distinct_terms = distinct.len();
    }

    // rank, keep top blocks, then re-emit in file order
    let mut ranked: Vec<usize> = (0..blocks.len()).collect();
    ranked.sort_by(|&a, &b| {
        blocks[b]
            .distinct_terms
            .cmp(&blocks[a].distinct_terms)
            .then_with(|| {
                let da = blocks[a].hits as f64 / (blocks[a].end - blocks[a].start + 1) as f64;
                let db = blocks[b].hits as f64 / (blocks[b].end - blocks[b].start + 1) as f64;
                db.partial_cmp(&da).unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| blocks[a].start.cmp(&blocks[b].start))
    });
    let mut keep: Vec<usize> = ranked.into_iter().take(opts.snippet_max_blocks).collect();
    keep.sort_unstable();

    let mut out = String::new();
    for (emitted, &bi) in keep.iter().enumerate() {
        let block = &blocks[bi];
        let text = lines[block.start..=block.end].join("\n");
        let sep = if emitted > 0 { "\n...\n".len() } else { 0 };
        if !out.is_empty() || emitted > 0 {
            if out.len() + sep + text.len() > opts.snippet_max_chars {
                break;
            }
            out.push_str("\n...\n");
        } else if text.len() > opts.snippet_max_chars {
            out.push_str(&text[..floor_char_boundary(&text, opts.snippet_max_chars)]);
            break;
        }
        out.push_str(&text);
    }
    out
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
