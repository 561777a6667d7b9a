//! Knowledge-base retrieval
//!
//! Keyword search over the `documents` table: documents are split into
//! overlapping chunks, chunks are ranked by query-term frequency, and the
//! best passages come back with their source title.

use crate::db::{Database, User};
use crate::tools::Tool;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

const CHUNK_SIZE: usize = 800;
const CHUNK_OVERLAP: usize = 100;

/// A retrieved passage and the document it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Passage {
    pub content: String,
    pub source: String,
}

/// Retrieval seam
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Passage>, String>;
}

#[async_trait]
impl<T: KnowledgeBase + ?Sized> KnowledgeBase for Arc<T> {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Passage>, String> {
        (**self).search(query, limit).await
    }
}

/// Keyword retrieval backed by the documents table
#[derive(Clone)]
pub struct SqliteKnowledgeBase {
    db: Database,
}

impl SqliteKnowledgeBase {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Index `.md` and `.txt` files under `dir`. Re-indexing a path replaces
    /// its content.
    pub fn index_directory(&self, dir: &Path) -> Result<usize, String> {
        let entries = std::fs::read_dir(dir).map_err(|e| e.to_string())?;
        let mut indexed = 0;

        for entry in entries {
            let entry = entry.map_err(|e| e.to_string())?;
            let path = entry.path();
            let is_text = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == "md" || ext == "txt");
            if !is_text {
                continue;
            }

            let content = std::fs::read_to_string(&path).map_err(|e| e.to_string())?;
            let title = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("document")
                .to_string();
            self.db
                .insert_document(&title, &path.to_string_lossy(), &content)
                .map_err(|e| e.to_string())?;
            indexed += 1;
        }

        tracing::info!(indexed, dir = %dir.display(), "Indexed knowledge documents");
        Ok(indexed)
    }
}

#[async_trait]
impl KnowledgeBase for SqliteKnowledgeBase {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Passage>, String> {
        let terms: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .filter(|t| t.len() > 2)
            .map(String::from)
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let documents = self.db.all_documents().map_err(|e| e.to_string())?;
        let mut ranked: Vec<(usize, Passage)> = Vec::new();

        for doc in &documents {
            for chunk in split_chunks(&doc.content, CHUNK_SIZE, CHUNK_OVERLAP) {
                let haystack = chunk.to_lowercase();
                let score: usize = terms
                    .iter()
                    .map(|term| haystack.matches(term.as_str()).count())
                    .sum();
                if score > 0 {
                    ranked.push((
                        score,
                        Passage {
                            content: chunk,
                            source: doc.title.clone(),
                        },
                    ));
                }
            }
        }

        ranked.sort_by(|a, b| b.0.cmp(&a.0));
        ranked.truncate(limit);
        Ok(ranked.into_iter().map(|(_, passage)| passage).collect())
    }
}

/// Overlapping character-window chunks
fn split_chunks(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let end = (start + size).min(chars.len());
        chunks.push(chars.get(start..end).unwrap_or_default().iter().collect());
        if end == chars.len() {
            break;
        }
        start = end.saturating_sub(overlap).max(start + 1);
    }

    chunks
}

/// `search_knowledge_base` tool
pub struct SearchKnowledgeTool {
    kb: Arc<dyn KnowledgeBase>,
}

impl SearchKnowledgeTool {
    pub fn new(kb: Arc<dyn KnowledgeBase>) -> Self {
        Self { kb }
    }
}

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
}

#[async_trait]
impl Tool for SearchKnowledgeTool {
    fn name(&self) -> &str {
        "search_knowledge_base"
    }

    fn description(&self) -> String {
        "Searches the knowledge base (purchasing policies, budget limits, procedures, FAQs). \
         Use this whenever the user asks about policies, processes, limits or any corporate information."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query about policies or procedures"
                }
            },
            "required": ["query"]
        })
    }

    async fn run(&self, args: Value, _caller: Option<&User>) -> Result<Value, String> {
        let args: SearchArgs =
            serde_json::from_value(args).map_err(|e| format!("Invalid arguments: {e}"))?;

        let passages = self.kb.search(&args.query, 5).await?;
        if passages.is_empty() {
            return Ok(json!({
                "results": [],
                "message": "No relevant information found.",
            }));
        }

        Ok(json!({
            "results": passages
                .iter()
                .map(|p| json!({"content": p.content, "source": p.source}))
                .collect::<Vec<_>>(),
            "message": format!("{} results found", passages.len()),
        }))
    }
}
