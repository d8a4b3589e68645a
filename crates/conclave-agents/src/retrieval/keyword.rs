//! In-memory keyword retriever

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

use super::{Document, QueryAnswer, RetrievedDocument, Retriever};
use crate::error::AgentResult;

const NO_MATCH_ANSWER: &str = "No relevant documents found.";

#[derive(Debug, Clone)]
struct IndexedDocument {
    id: String,
    document: Document,
    terms: HashSet<String>,
}

/// Scores documents by the share of query terms they contain
///
/// Deterministic and dependency-free; ties keep indexing order. The answer
/// is the text of the matched documents, best first.
#[derive(Debug, Default)]
pub struct KeywordRetriever {
    documents: RwLock<Vec<IndexedDocument>>,
}

impl KeywordRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a retriever over `texts`, ids assigned in order
    pub fn with_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let retriever = Self::new();
        retriever.index(texts.into_iter().map(Document::new).collect());
        retriever
    }

    pub fn len(&self) -> usize {
        self.documents.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn index(&self, documents: Vec<Document>) -> usize {
        let mut store = self.documents.write().unwrap_or_else(PoisonError::into_inner);
        let count = documents.len();
        for document in documents {
            let id = document
                .id
                .clone()
                .unwrap_or_else(|| format!("doc_{}", store.len()));
            let terms = terms(&document.text);
            store.push(IndexedDocument {
                id,
                document,
                terms,
            });
        }
        count
    }

    fn search(&self, text: &str, top_k: usize) -> Vec<RetrievedDocument> {
        let query_terms = terms(text);
        if query_terms.is_empty() || top_k == 0 {
            return Vec::new();
        }

        let store = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        let mut hits: Vec<RetrievedDocument> = store
            .iter()
            .filter_map(|indexed| {
                let matched = query_terms.intersection(&indexed.terms).count();
                (matched > 0).then(|| RetrievedDocument {
                    id: indexed.id.clone(),
                    text: indexed.document.text.clone(),
                    score: matched as f64 / query_terms.len() as f64,
                    metadata: indexed.document.metadata.clone(),
                })
            })
            .collect();
        // stable sort keeps indexing order among equal scores
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);
        hits
    }
}

#[async_trait]
impl Retriever for KeywordRetriever {
    async fn query(&self, text: &str, top_k: usize) -> AgentResult<QueryAnswer> {
        let retrieved_documents = self.search(text, top_k);
        let answer = if retrieved_documents.is_empty() {
            NO_MATCH_ANSWER.to_string()
        } else {
            retrieved_documents
                .iter()
                .map(|doc| doc.text.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        };
        Ok(QueryAnswer {
            answer,
            retrieved_documents,
        })
    }

    async fn retrieve(&self, text: &str, top_k: usize) -> AgentResult<Vec<RetrievedDocument>> {
        Ok(self.search(text, top_k))
    }

    async fn add_documents(&self, documents: Vec<Document>) -> AgentResult<usize> {
        Ok(self.index(documents))
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}
