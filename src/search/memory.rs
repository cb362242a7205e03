//! In-process index: ordered documents per project, paged on demand.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::RwLock;

use super::{Document, Page, SearchIndex, SearchQuery, SortKey};
use crate::error::{PipelineError, Result};

/// Documents keyed by project index, kept in insertion order.
#[derive(Clone, Default)]
pub struct InMemoryIndex {
    indices: Arc<RwLock<HashMap<String, Vec<Document>>>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append documents to `index`, replacing any existing one with the same id.
    pub async fn index_documents(&self, index: &str, docs: impl IntoIterator<Item = Document>) {
        let mut indices = self.indices.write().await;
        let stored = indices.entry(index.to_string()).or_default();
        for doc in docs {
            match stored.iter_mut().find(|d| d.id == doc.id) {
                Some(existing) => *existing = doc,
                None => stored.push(doc),
            }
        }
    }

    pub async fn get(&self, index: &str, doc_id: &str) -> Option<Document> {
        self.indices
            .read()
            .await
            .get(index)?
            .iter()
            .find(|d| d.id == doc_id)
            .cloned()
    }

    async fn update<F>(&self, index: &str, doc_id: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut Document),
    {
        let mut indices = self.indices.write().await;
        let doc = indices
            .get_mut(index)
            .and_then(|docs| docs.iter_mut().find(|d| d.id == doc_id))
            .ok_or_else(|| {
                PipelineError::Search(format!("document {} not found in {}", doc_id, index))
            })?;
        apply(doc);
        Ok(())
    }
}

#[async_trait]
impl SearchIndex for InMemoryIndex {
    fn poll_pages(&self, query: &SearchQuery) -> BoxStream<'static, Result<Page>> {
        if query.page_size == 0 {
            return stream::once(async {
                Err(PipelineError::InvalidInput(
                    "page size must be at least one".to_string(),
                ))
            })
            .boxed();
        }
        let indices = self.indices.clone();
        let query = query.clone();
        // Pages are cut from a snapshot taken on first poll, like a scroll context
        stream::once(async move {
            let indices = indices.read().await;
            let mut hits: Vec<Document> = match indices.get(&query.index) {
                Some(docs) => docs
                    .iter()
                    .filter(|d| query.filter.matches(d))
                    .cloned()
                    .collect(),
                None => {
                    return Err(PipelineError::Search(format!(
                        "no such index: {}",
                        query.index
                    )))
                }
            };
            if query.sort == SortKey::Language {
                // Stable: index order is kept within a language
                hits.sort_by(|a, b| a.language.cmp(&b.language));
            }
            let pages: Vec<Page> = hits
                .chunks(query.page_size)
                .map(|page| page.to_vec())
                .collect();
            tracing::debug!(index = %query.index, pages = pages.len(), "Polled search pages");
            Ok(pages)
        })
        .flat_map(|pages| match pages {
            Ok(pages) => stream::iter(pages.into_iter().map(Ok::<_, PipelineError>)).boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        })
        .boxed()
    }

    async fn add_translation(
        &self,
        index: &str,
        doc_id: &str,
        language: &str,
        translation: String,
    ) -> Result<()> {
        self.update(index, doc_id, |doc| {
            doc.content_translated
                .insert(language.to_string(), translation);
        })
        .await
    }

    async fn add_tag(&self, index: &str, doc_id: &str, tag: &str) -> Result<()> {
        self.update(index, doc_id, |doc| {
            if !doc.tags.iter().any(|t| t == tag) {
                doc.tags.push(tag.to_string());
            }
        })
        .await
    }
}
