//! CodeRAG — local hybrid code search.
//!
//! Indexes a directory of source code at chunk granularity (AST declaration
//! boundaries, character fallback) into an embedded SQLite store, answers
//! free-text queries with chunk-level BM25, optionally fuses in results from
//! an external vector store, and keeps the index current under a debounced
//! file watcher.
//!
//! The typical flow:
//!
//! ```no_run
//! use coderag::{Indexer, IndexerConfig, SearchOptions};
//!
//! # fn main() -> coderag::Result<()> {
//! let indexer = Indexer::open(IndexerConfig::new("."))?;
//! indexer.index()?;
//! let hits = indexer.search("parse query", &SearchOptions::default())?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod chunker;
pub mod config;
pub mod diff;
pub mod error;
pub mod indexer;
pub mod project;
pub mod query;
pub mod scan;
pub mod store;
pub mod tokenizer;
pub mod vector;
pub mod watcher;

pub use cache::CacheStats;
pub use chunker::{ChunkResult, Chunker};
pub use config::IndexerConfig;
pub use error::{Error, Result};
pub use indexer::{IndexReport, IndexStats, Indexer};
pub use query::{ScoreMethod, SearchOptions, SearchResult};
pub use tokenizer::CodeTokenizer;
pub use vector::{EmbeddingProvider, FlatVectorStore, VectorHit, VectorMetadata, VectorStore};
pub use watcher::{start_watcher, FileWatcher};
