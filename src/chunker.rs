//! AST-driven semantic chunking with a memory-bounded worker lifecycle.
//!
//! Source files in supported languages are parsed with tree-sitter and split
//! at declaration boundaries; everything else (and every parse failure) goes
//! through character chunking. Parsing runs on a dedicated worker thread that
//! is recycled after a configurable number of files so native parser state
//! cannot grow without bound. Recycling is transparent except to requests
//! already in flight, which fail with a retryable error.

use dashmap::DashMap;
use serde_json::{json, Map, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use tree_sitter::{Language, Node, Parser};

use crate::error::{Error, Result};

/// Worker is torn down and respawned after this many parsed files.
pub const DEFAULT_RECYCLE_AFTER: usize = 4000;

/// Kind label assigned to character-fallback chunks.
pub const FALLBACK_KIND: &str = "text";

// ---------------------------------------------------------------------------
// Chunk result
// ---------------------------------------------------------------------------

/// One chunk of a source file. `content` is an exact slice of the input;
/// line numbers are 1-based inclusive, except fallback chunks where both
/// are 0.
#[derive(Debug, Clone)]
pub struct ChunkResult {
    pub content: String,
    pub kind: String,
    pub start_line: u32,
    pub end_line: u32,
    pub metadata: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Language resolution
// ---------------------------------------------------------------------------

fn language_for_ext(ext: &str) -> Option<Language> {
    match ext {
        "rs" => Some(tree_sitter_rust::LANGUAGE.into()),
        "ts" => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
        "tsx" => Some(tree_sitter_typescript::LANGUAGE_TSX.into()),
        "js" | "jsx" | "mjs" | "cjs" => Some(tree_sitter_javascript::LANGUAGE.into()),
        "py" | "pyi" => Some(tree_sitter_python::LANGUAGE.into()),
        "go" => Some(tree_sitter_go::LANGUAGE.into()),
        "java" => Some(tree_sitter_java::LANGUAGE.into()),
        _ => None,
    }
}

/// Language tag stored on file rows, derived from the extension.
pub fn language_tag(ext: &str) -> Option<&'static str> {
    match ext {
        "rs" => Some("rust"),
        "ts" | "tsx" => Some("typescript"),
        "js" | "jsx" | "mjs" | "cjs" => Some("javascript"),
        "py" | "pyi" => Some("python"),
        "go" => Some("go"),
        "java" => Some("java"),
        _ => None,
    }
}

/// Node kinds that form chunk boundaries, per language family.
fn is_declaration(kind: &str) -> bool {
    matches!(
        kind,
        // Rust
        "function_item"
            | "struct_item"
            | "enum_item"
            | "trait_item"
            | "impl_item"
            | "type_item"
            | "const_item"
            | "static_item"
            | "mod_item"
            // TS / JS
            | "function_declaration"
            | "generator_function_declaration"
            | "class_declaration"
            | "abstract_class_declaration"
            | "interface_declaration"
            | "type_alias_declaration"
            | "enum_declaration"
            | "export_statement"
            // Python
            | "function_definition"
            | "class_definition"
            | "decorated_definition"
            // Go
            | "method_declaration"
            | "type_declaration"
            // Java
            | "record_declaration"
            | "annotation_type_declaration"
    )
}

/// Extract a display name for a declaration node, when the grammar exposes one.
fn extract_name(node: &Node, source: &[u8]) -> Option<String> {
    for field in ["name", "type", "declarator"] {
        if let Some(child) = node.child_by_field_name(field) {
            if let Ok(text) = child.utf8_text(source) {
                let name = text.trim();
                if !name.is_empty() && name.len() <= 200 {
                    return Some(name.to_string());
                }
            }
        }
    }
    // export_statement: name lives on the exported declaration
    if node.kind() == "export_statement" {
        if let Some(decl) = node.child_by_field_name("declaration") {
            return extract_name(&decl, source);
        }
    }
    // decorated_definition: name lives on the wrapped def
    if node.kind() == "decorated_definition" {
        if let Some(def) = node.child_by_field_name("definition") {
            return extract_name(&def, source);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Parsing (runs on the worker thread)
// ---------------------------------------------------------------------------

/// Parse source into declaration-boundary chunks. `Err` carries the parse
/// failure cause; `Ok(vec![])` means the tree held no declarations.
fn parse_chunks(
    parser: &mut Parser,
    lang: &Language,
    content: &str,
    ext: &str,
    max_chunk_size: usize,
) -> std::result::Result<Vec<ChunkResult>, String> {
    parser
        .set_language(lang)
        .map_err(|e| format!("language version mismatch: {e}"))?;
    let tree = parser
        .parse(content, None)
        .ok_or_else(|| "parser returned no tree".to_string())?;
    let root = tree.root_node();
    let source = content.as_bytes();

    let mut chunks = Vec::new();
    let mut cursor = root.walk();
    for node in root.children(&mut cursor) {
        if !is_declaration(node.kind()) {
            continue;
        }
        let text = match node.utf8_text(source) {
            Ok(t) => t,
            Err(_) => continue,
        };
        let start_line = node.start_position().row as u32 + 1;
        let end_line = node.end_position().row as u32 + 1;

        let mut metadata = Map::new();
        if let Some(name) = extract_name(&node, source) {
            metadata.insert("name".into(), json!(name));
        }
        if let Some(tag) = language_tag(ext) {
            metadata.insert("language".into(), json!(tag));
        }

        if text.len() > max_chunk_size {
            for piece in split_oversize(text, start_line, max_chunk_size) {
                chunks.push(ChunkResult {
                    content: piece.content,
                    kind: node.kind().to_string(),
                    start_line: piece.start_line,
                    end_line: piece.end_line,
                    metadata: metadata.clone(),
                });
            }
        } else {
            chunks.push(ChunkResult {
                content: text.to_string(),
                kind: node.kind().to_string(),
                start_line,
                end_line,
                metadata,
            });
        }
    }
    Ok(chunks)
}

struct SplitPiece {
    content: String,
    start_line: u32,
    end_line: u32,
}

/// Deterministic oversize split: cut greedily at the last line break at or
/// below `max_chunk_size` bytes per piece; a single line longer than the
/// budget becomes its own piece. Concatenating the pieces reproduces the
/// input, and line ranges stay contiguous.
fn split_oversize(text: &str, first_line: u32, max_chunk_size: usize) -> Vec<SplitPiece> {
    let mut pieces = Vec::new();
    let mut rest = text;
    let mut line = first_line;

    while !rest.is_empty() {
        let cut = if rest.len() <= max_chunk_size {
            rest.len()
        } else {
            match rest[..max_chunk_size].rfind('\n') {
                Some(pos) => pos + 1,
                // no break inside the budget: take the whole long line
                None => rest.find('\n').map(|p| p + 1).unwrap_or(rest.len()),
            }
        };
        let piece = &rest[..cut];
        let newlines = piece.matches('\n').count() as u32;
        let trailing = piece.ends_with('\n');
        // an ending newline belongs to the last in-range line, not a new one
        let end_line = line + newlines.saturating_sub(trailing as u32);
        pieces.push(SplitPiece { content: piece.to_string(), start_line: line, end_line });
        line += newlines;
        rest = &rest[cut..];
    }
    pieces
}

/// Character fallback for unsupported or unparseable files.
fn fallback_chunks(content: &str, max_chunk_size: usize) -> Vec<ChunkResult> {
    if content.trim().is_empty() {
        return Vec::new();
    }
    let mut metadata = Map::new();
    metadata.insert("fallback".into(), json!(true));
    split_oversize(content, 1, max_chunk_size)
        .into_iter()
        .map(|piece| ChunkResult {
            content: piece.content,
            kind: FALLBACK_KIND.to_string(),
            start_line: 0,
            end_line: 0,
            metadata: metadata.clone(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Worker lifecycle
// ---------------------------------------------------------------------------

struct ChunkRequest {
    ext: String,
    content: String,
    max_chunk_size: usize,
    reply: mpsc::SyncSender<std::result::Result<Vec<ChunkResult>, String>>,
}

struct WorkerHandle {
    tx: mpsc::Sender<ChunkRequest>,
    retired: Arc<AtomicBool>,
    served: usize,
}

fn spawn_worker() -> WorkerHandle {
    let (tx, rx) = mpsc::channel::<ChunkRequest>();
    let retired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&retired);

    std::thread::Builder::new()
        .name("coderag-chunker".into())
        .spawn(move || {
            // Parsers live for the worker's lifetime; recycling the worker
            // releases whatever native state they have accumulated.
            let mut parser = Parser::new();
            while let Ok(req) = rx.recv() {
                if flag.load(Ordering::Acquire) {
                    // request arrived for a retired generation
                    let _ = req.reply.send(Err("worker recycled".into()));
                    continue;
                }
                let lang = match language_for_ext(&req.ext) {
                    Some(l) => l,
                    None => {
                        let _ = req.reply.send(Err(format!("no grammar for .{}", req.ext)));
                        continue;
                    }
                };
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    parse_chunks(&mut parser, &lang, &req.content, &req.ext, req.max_chunk_size)
                }))
                .unwrap_or_else(|_| Err("parser panicked".into()));
                let _ = req.reply.send(outcome);
            }
            debug!("chunk worker exiting");
        })
        .expect("failed to spawn chunk worker thread");

    WorkerHandle { tx, retired, served: 0 }
}

/// Semantic chunker. Owns the worker thread and its recycling policy.
pub struct Chunker {
    worker: Mutex<WorkerHandle>,
    recycle_after: usize,
    /// Files already warned about in fallback, so each file warns at most once.
    warned: DashMap<String, ()>,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new()
    }
}

impl Chunker {
    pub fn new() -> Self {
        Self::with_recycle_after(DEFAULT_RECYCLE_AFTER)
    }

    pub fn with_recycle_after(recycle_after: usize) -> Self {
        Self {
            worker: Mutex::new(spawn_worker()),
            recycle_after: recycle_after.max(1),
            warned: DashMap::new(),
        }
    }

    /// Chunk one file. Unsupported extensions and parse failures produce
    /// fallback chunks; the only error a caller sees is the retryable
    /// [`Error::WorkerRecycled`] when a recycle raced the request.
    pub fn chunk(
        &self,
        file_path: &str,
        content: &str,
        max_chunk_size: usize,
    ) -> Result<Vec<ChunkResult>> {
        let ext = file_path.rsplit('.').next().unwrap_or("");
        if language_for_ext(ext).is_none() {
            return Ok(fallback_chunks(content, max_chunk_size));
        }

        let (tx, retired) = {
            let mut handle = match self.worker.lock() {
                Ok(h) => h,
                Err(poisoned) => poisoned.into_inner(),
            };
            if handle.served >= self.recycle_after {
                debug!(served = handle.served, "recycling chunk worker");
                handle.retired.store(true, Ordering::Release);
                *handle = spawn_worker();
            }
            handle.served += 1;
            (handle.tx.clone(), Arc::clone(&handle.retired))
        };

        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let request = ChunkRequest {
            ext: ext.to_string(),
            content: content.to_string(),
            max_chunk_size,
            reply: reply_tx,
        };
        if tx.send(request).is_err() {
            return Err(Error::WorkerRecycled);
        }

        match reply_rx.recv() {
            Ok(Ok(chunks)) if !chunks.is_empty() => Ok(chunks),
            Ok(Ok(_)) => {
                // parsed fine but held no declarations
                if !content.trim().is_empty() {
                    self.warn_once(file_path, "no semantic chunks in parse tree");
                }
                Ok(fallback_chunks(content, max_chunk_size))
            }
            Ok(Err(cause)) => {
                if retired.load(Ordering::Acquire) {
                    return Err(Error::WorkerRecycled);
                }
                self.warn_once(file_path, &cause);
                Ok(fallback_chunks(content, max_chunk_size))
            }
            // reply sender dropped: the worker died under us
            Err(_) => Err(Error::WorkerRecycled),
        }
    }

    fn warn_once(&self, file_path: &str, cause: &str) {
        if self.warned.insert(file_path.to_string(), ()).is_none() {
            warn!(file = file_path, cause = cause, "semantic chunking fell back to text");
        }
    }

    /// Number of files served by the current worker generation.
    #[cfg(test)]
    fn served(&self) -> usize {
        self.worker.lock().map(|h| h.served).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_rust_declarations() {
        let c = Chunker::new();
        let src = "pub fn greet(name: &str) -> String {\n    format!(\"hi {name}\")\n}\n\nstruct Config {\n    verbose: bool,\n}\n";
        let chunks = c.chunk("src/lib.rs", src, 2000).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].kind, "function_item");
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 3);
        assert_eq!(chunks[0].metadata["name"], "greet");
        assert_eq!(chunks[1].kind, "struct_item");
        assert_eq!(chunks[1].start_line, 5);
    }

    #[test]
    fn test_chunk_content_is_exact_slice() {
        let c = Chunker::new();
        let src = "fn a() {\n    1 + 1;\n}\n\nfn b() {\n    2 + 2;\n}\n";
        let chunks = c.chunk("x.rs", src, 2000).unwrap();
        for chunk in &chunks {
            assert!(src.contains(&chunk.content), "chunk must be a slice of the file");
        }
    }

    #[test]
    fn test_single_line_js_function() {
        let c = Chunker::new();
        let src = "function parseQuery(query) { return query.toLowerCase().split(/\\s+/) }";
        let chunks = c.chunk("app.js", src, 2000).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].kind, "function_declaration");
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 1);
        assert_eq!(chunks[0].metadata["name"], "parseQuery");
    }

    #[test]
    fn test_typescript_interface_and_export() {
        let c = Chunker::new();
        let src = "export function load(): void {}\n\ninterface Options {\n  depth: number;\n}\n";
        let chunks = c.chunk("opts.ts", src, 2000).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].kind, "export_statement");
        assert_eq!(chunks[0].metadata["name"], "load");
        assert_eq!(chunks[1].kind, "interface_declaration");
    }

    #[test]
    fn test_python_defs() {
        let c = Chunker::new();
        let src = "def greet(name):\n    return f\"hi {name}\"\n\nclass Config:\n    def __init__(self):\n        self.x = 1\n";
        let chunks = c.chunk("mod.py", src, 2000).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].kind, "function_definition");
        assert_eq!(chunks[1].kind, "class_definition");
    }

    #[test]
    fn test_unknown_extension_falls_back() {
        let c = Chunker::new();
        let chunks = c.chunk("README.md", "# hello\nsome text\n", 2000).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].kind, FALLBACK_KIND);
        assert_eq!(chunks[0].start_line, 0);
        assert_eq!(chunks[0].end_line, 0);
        assert_eq!(chunks[0].metadata["fallback"], true);
    }

    #[test]
    fn test_no_declarations_falls_back() {
        let c = Chunker::new();
        // valid JS, but only bare statements
        let chunks = c.chunk("top.js", "console.log(1);\nconsole.log(2);\n", 2000).unwrap();
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|ch| ch.kind == FALLBACK_KIND));
    }

    #[test]
    fn test_blank_input_yields_nothing() {
        let c = Chunker::new();
        assert!(c.chunk("empty.md", "   \n\n", 2000).unwrap().is_empty());
        assert!(c.chunk("empty.rs", "", 2000).unwrap().is_empty());
    }

    #[test]
    fn test_oversize_split_preserves_content_and_lines() {
        let text: String = (1..=40).map(|i| format!("line number {i:03}\n")).collect();
        let pieces = split_oversize(&text, 10, 100);
        assert!(pieces.len() > 1);
        let rejoined: String = pieces.iter().map(|p| p.content.as_str()).collect();
        assert_eq!(rejoined, text);
        assert_eq!(pieces[0].start_line, 10);
        for pair in pieces.windows(2) {
            assert_eq!(pair[1].start_line, pair[0].end_line + 1, "ranges must be contiguous");
        }
        for p in &pieces {
            assert!(p.content.len() <= 100 || !p.content.trim_end_matches('\n').contains('\n'));
        }
    }

    #[test]
    fn test_oversize_single_long_line() {
        let text = "x".repeat(500);
        let pieces = split_oversize(&text, 1, 100);
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].start_line, 1);
        assert_eq!(pieces[0].end_line, 1);
    }

    #[test]
    fn test_large_rust_fn_is_split() {
        let body: String = (0..200).map(|i| format!("    let v{i} = {i};\n")).collect();
        let src = format!("fn big() {{\n{body}}}\n");
        let c = Chunker::new();
        let chunks = c.chunk("big.rs", &src, 500).unwrap();
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|ch| ch.kind == "function_item"));
        let rejoined: String = chunks.iter().map(|ch| ch.content.as_str()).collect();
        assert!(src.contains(&rejoined), "split pieces must rejoin into the node text");
        // monotone, contiguous line ranges
        for pair in chunks.windows(2) {
            assert!(pair[1].start_line > pair[0].start_line);
        }
    }

    #[test]
    fn test_worker_recycling_is_transparent() {
        let c = Chunker::with_recycle_after(2);
        for i in 0..6 {
            let src = format!("fn f{i}() {{}}\n");
            let chunks = c.chunk(&format!("f{i}.rs"), &src, 2000).unwrap();
            assert_eq!(chunks.len(), 1, "request {i} should succeed across recycles");
        }
        // counter resets on recycle
        assert!(c.served() <= 2);
    }
}
