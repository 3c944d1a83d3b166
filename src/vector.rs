//! Vector store contract and the in-process reference implementation.
//!
//! The ANN engine itself is external; this module fixes the adapter surface
//! the rest of the crate programs against, plus a flat brute-force cosine
//! store good enough for tests and small projects. Document ids are
//! `chunk://<path>:<start>-<end>` so deleting a file reduces to one prefix
//! delete.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::error::{Error, Result};

/// Stable document id for a chunk.
pub fn chunk_vector_id(path: &str, start_line: u32, end_line: u32) -> String {
    format!("chunk://{path}:{start_line}-{end_line}")
}

/// Id prefix covering every chunk of a file.
pub fn chunk_id_prefix(path: &str) -> String {
    format!("chunk://{path}:")
}

/// Longest content preview stored alongside an embedding.
pub const PREVIEW_MAX_CHARS: usize = 500;

/// Truncate chunk content to the preview budget at a char boundary.
pub fn content_preview(content: &str) -> String {
    if content.chars().count() <= PREVIEW_MAX_CHARS {
        content.to_string()
    } else {
        content.chars().take(PREVIEW_MAX_CHARS).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorMetadata {
    pub kind: String,
    pub language: Option<String>,
    pub preview: String,
    pub path: String,
    pub start_line: u32,
    pub end_line: u32,
}

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    /// In [0, 1], higher is better.
    pub similarity: f32,
}

/// Contract to an external ANN store. Prefix deletion is mandatory: an
/// adapter that cannot remove `chunk://<path>:` records on file deletion
/// leaks documents and cannot implement this trait correctly.
pub trait VectorStore: Send + Sync {
    fn upsert(&self, id: &str, embedding: &[f32], metadata: VectorMetadata) -> Result<()>;

    /// Remove every document whose id starts with `prefix`; returns how many.
    fn delete_by_prefix(&self, prefix: &str) -> Result<usize>;

    /// kNN search. Results are ordered by similarity descending.
    fn search(&self, query_embedding: &[f32], k: usize) -> Result<Vec<VectorHit>>;
}

/// Producer of chunk embeddings. Network-backed implementations live
/// upstream; the index builder only needs the batch call.
pub trait EmbeddingProvider: Send + Sync {
    fn dimensions(&self) -> usize;
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ---------------------------------------------------------------------------
// Flat in-process store: brute-force cosine over an in-memory table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FlatRecord {
    embedding: Vec<f32>,
    metadata: VectorMetadata,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FlatTable {
    records: HashMap<String, FlatRecord>,
}

/// Reference [`VectorStore`]: O(n·d) cosine scan, optionally persisted as a
/// single JSON file next to the relational store.
pub struct FlatVectorStore {
    table: RwLock<FlatTable>,
    path: Option<PathBuf>,
}

impl FlatVectorStore {
    pub fn in_memory() -> Self {
        Self { table: RwLock::new(FlatTable::default()), path: None }
    }

    /// Open a persisted store; a missing or unreadable file starts empty
    /// (the index rebuild repopulates it).
    pub fn open(path: PathBuf) -> Self {
        let table = std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        Self { table: RwLock::new(table), path: Some(path) }
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, FlatTable> {
        match self.table.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, FlatTable> {
        match self.table.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn persist(&self, table: &FlatTable) -> Result<()> {
        if let Some(path) = &self.path {
            let text = serde_json::to_string(table)
                .map_err(|e| Error::VectorUnavailable(e.to_string()))?;
            std::fs::write(path, text).map_err(|e| Error::io(path.clone(), e))?;
        }
        Ok(())
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

impl VectorStore for FlatVectorStore {
    fn upsert(&self, id: &str, embedding: &[f32], metadata: VectorMetadata) -> Result<()> {
        let mut table = self.write();
        table.records.insert(
            id.to_string(),
            FlatRecord { embedding: embedding.to_vec(), metadata },
        );
        self.persist(&table)
    }

    fn delete_by_prefix(&self, prefix: &str) -> Result<usize> {
        let mut table = self.write();
        let before = table.records.len();
        table.records.retain(|id, _| !id.starts_with(prefix));
        let removed = before - table.records.len();
        if removed > 0 {
            self.persist(&table)?;
        }
        Ok(removed)
    }

    fn search(&self, query_embedding: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        let table = self.read();
        let mut hits: Vec<VectorHit> = table
            .records
            .iter()
            .map(|(id, rec)| {
                // cosine distance mapped into (0, 1] via 1 / (1 + distance)
                let distance = 1.0 - cosine(query_embedding, &rec.embedding);
                VectorHit { id: id.clone(), similarity: 1.0 / (1.0 + distance) }
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(path: &str) -> VectorMetadata {
        VectorMetadata {
            kind: "function_item".into(),
            language: Some("rust".into()),
            preview: "fn x() {}".into(),
            path: path.into(),
            start_line: 1,
            end_line: 3,
        }
    }

    #[test]
    fn test_id_format() {
        assert_eq!(chunk_vector_id("src/a.rs", 10, 20), "chunk://src/a.rs:10-20");
        assert!(chunk_vector_id("src/a.rs", 10, 20).starts_with(&chunk_id_prefix("src/a.rs")));
        // prefix of a.rs must not cover a.rs.bak
        assert!(!chunk_vector_id("src/a.rs.bak", 1, 2).starts_with(&chunk_id_prefix("src/a.rs")));
    }

    #[test]
    fn test_upsert_overwrites_by_id() {
        let store = FlatVectorStore::in_memory();
        store.upsert("chunk://a.rs:1-2", &[1.0, 0.0], meta("a.rs")).unwrap();
        store.upsert("chunk://a.rs:1-2", &[0.0, 1.0], meta("a.rs")).unwrap();
        assert_eq!(store.len(), 1);
        let hits = store.search(&[0.0, 1.0], 1).unwrap();
        assert!(hits[0].similarity > 0.99);
    }

    #[test]
    fn test_delete_by_prefix() {
        let store = FlatVectorStore::in_memory();
        store.upsert(&chunk_vector_id("a.rs", 1, 2), &[1.0], meta("a.rs")).unwrap();
        store.upsert(&chunk_vector_id("a.rs", 3, 9), &[1.0], meta("a.rs")).unwrap();
        store.upsert(&chunk_vector_id("b.rs", 1, 2), &[1.0], meta("b.rs")).unwrap();
        let removed = store.delete_by_prefix(&chunk_id_prefix("a.rs")).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_search_orders_by_similarity() {
        let store = FlatVectorStore::in_memory();
        store.upsert("near", &[1.0, 0.0], meta("a.rs")).unwrap();
        store.upsert("far", &[-1.0, 0.0], meta("b.rs")).unwrap();
        store.upsert("mid", &[1.0, 1.0], meta("c.rs")).unwrap();
        let hits = store.search(&[1.0, 0.0], 3).unwrap();
        assert_eq!(hits[0].id, "near");
        assert_eq!(hits[2].id, "far");
        for hit in &hits {
            assert!((0.0..=1.0).contains(&hit.similarity));
        }
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.json");
        {
            let store = FlatVectorStore::open(path.clone());
            store.upsert("chunk://a.rs:1-2", &[0.5, 0.5], meta("a.rs")).unwrap();
        }
        let store = FlatVectorStore::open(path);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_content_preview_truncates() {
        let long = "x".repeat(2000);
        assert_eq!(content_preview(&long).chars().count(), PREVIEW_MAX_CHARS);
        assert_eq!(content_preview("short"), "short");
    }
}
