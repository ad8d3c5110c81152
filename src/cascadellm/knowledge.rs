//! Knowledge-retrieval seam.
//!
//! Agents may consult a [`KnowledgeSource`] for context snippets before
//! calling the inference provider. The cascade core never queries it
//! directly. Real deployments back this with a vector store; the bundled
//! [`StaticKnowledgeBase`] is an in-memory implementation with naive
//! term-overlap ranking, enough for tests and small curated document sets.

use async_trait::async_trait;
use std::error::Error;
use std::fmt;

/// One retrieved context fragment.
#[derive(Debug, Clone)]
pub struct ContextSnippet {
    /// Where the fragment came from (document id, URL, ...).
    pub source: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct KnowledgeError {
    pub message: String,
}

impl fmt::Display for KnowledgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "knowledge lookup failed: {}", self.message)
    }
}

impl Error for KnowledgeError {}

/// Interface to the document-retrieval collaborator.
#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    /// Return up to `max_items` snippets relevant to `text`, most relevant
    /// first.
    async fn query(
        &self,
        text: &str,
        max_items: usize,
    ) -> Result<Vec<ContextSnippet>, KnowledgeError>;
}

/// In-memory snippet store ranked by shared-term count.
#[derive(Default)]
pub struct StaticKnowledgeBase {
    documents: Vec<ContextSnippet>,
}

impl StaticKnowledgeBase {
    pub fn new() -> Self {
        Self {
            documents: Vec::new(),
        }
    }

    /// Add a document (builder pattern).
    pub fn with_document(mut self, source: impl Into<String>, content: impl Into<String>) -> Self {
        self.documents.push(ContextSnippet {
            source: source.into(),
            content: content.into(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl KnowledgeSource for StaticKnowledgeBase {
    async fn query(
        &self,
        text: &str,
        max_items: usize,
    ) -> Result<Vec<ContextSnippet>, KnowledgeError> {
        let terms: Vec<String> = text
            .split_whitespace()
            .map(|t| t.to_ascii_lowercase())
            .collect();

        let mut scored: Vec<(usize, &ContextSnippet)> = self
            .documents
            .iter()
            .map(|doc| {
                let haystack = doc.content.to_ascii_lowercase();
                let score = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
                (score, doc)
            })
            .filter(|(score, _)| *score > 0)
            .collect();

        // Stable sort keeps insertion order among equally relevant docs.
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored
            .into_iter()
            .take(max_items)
            .map(|(_, doc)| doc.clone())
            .collect())
    }
}
