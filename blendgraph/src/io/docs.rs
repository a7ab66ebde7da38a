//! Reference documents for retrieval-augmented coding.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Read-only similarity search over a document corpus.
pub trait DocumentStore {
    /// Up to `k` documents ranked by similarity to `query`, best first.
    fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<Document>>;
}

/// Corpus loaded from a JSON array of documents, ranked by term overlap.
///
/// Ranking is deterministic: ties keep corpus order.
#[derive(Debug, Clone, Default)]
pub struct JsonDocumentStore {
    documents: Vec<Document>,
}

impl JsonDocumentStore {
    pub fn new(documents: Vec<Document>) -> Self {
        Self { documents }
    }

    /// Load the corpus. A missing file yields an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no document corpus, retrieval will find nothing");
            return Ok(Self::default());
        }
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let documents: Vec<Document> =
            serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
        debug!(path = %path.display(), count = documents.len(), "loaded document corpus");
        Ok(Self { documents })
    }
}

impl DocumentStore for JsonDocumentStore {
    fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<Document>> {
        let terms = tokenize(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let mut scored: Vec<(usize, usize)> = self
            .documents
            .iter()
            .enumerate()
            .map(|(idx, doc)| (idx, tokenize(&doc.content).intersection(&terms).count()))
            .filter(|(_, score)| *score > 0)
            .collect();
        // Stable sort keeps corpus order among equal scores.
        scored.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(scored
            .into_iter()
            .take(k)
            .map(|(idx, _)| self.documents[idx].clone())
            .collect())
    }
}

fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() > 1)
        .map(str::to_lowercase)
        .collect()
}
