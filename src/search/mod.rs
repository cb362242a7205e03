//! Search module - the ordered document source pipelines plan from.
//!
//! # Key Concepts
//! - Query: one filter and sort order over one project index
//! - Pages: results come back as an ordered stream of pages, the way a
//!   scrolling search does; callers flatten them into documents
//! - Side effects: handlers write translations and tags back to the index

mod memory;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

pub use memory::InMemoryIndex;

/// Default number of hits per page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// An indexed document, restricted to the fields pipelines read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    /// Routing key: the top-level document this one was extracted from.
    pub root_document: String,
    pub content: String,
    pub language: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub content_translated: BTreeMap<String, String>,
}

impl Document {
    pub fn new(
        id: impl Into<String>,
        content: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            root_document: id.clone(),
            id,
            content: content.into(),
            language: language.into(),
            tags: Vec::new(),
            content_translated: BTreeMap::new(),
        }
    }

    /// Content in `language`: the original if it's written in it, else a translation.
    pub fn content_in(&self, language: &str) -> Option<&str> {
        if self.language == language {
            return Some(&self.content);
        }
        self.content_translated.get(language).map(String::as_str)
    }
}

/// Tag prefix marking a document as classified by `model`.
pub fn classification_tag_prefix(model: &str) -> String {
    format!("classified:{}:", model)
}

/// Tag recording the label `model` gave to a document.
pub fn classification_tag(model: &str, label: &str) -> String {
    format!("{}{}", classification_tag_prefix(model), label)
}

/// Which documents a query selects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DocFilter {
    All,
    Ids { ids: Vec<String> },
    /// Not written in `target` and not yet translated to it.
    Untranslated { target: String },
    /// Not tagged by `model` yet, and readable in `language`.
    Unclassified { model: String, language: String },
}

impl DocFilter {
    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Ids {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Self::All => true,
            Self::Ids { ids } => ids.iter().any(|id| *id == doc.id),
            Self::Untranslated { target } => {
                doc.language != *target && !doc.content_translated.contains_key(target)
            }
            Self::Unclassified { model, language } => {
                let prefix = classification_tag_prefix(model);
                !doc.tags.iter().any(|t| t.starts_with(&prefix))
                    && doc.content_in(language).is_some()
            }
        }
    }
}

/// Result ordering. Ties always fall back to index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    /// Language ascending, then index order.
    Language,
    /// Index order.
    #[default]
    DocOrder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub index: String,
    pub filter: DocFilter,
    #[serde(default)]
    pub sort: SortKey,
    pub page_size: usize,
}

impl SearchQuery {
    pub fn new(index: impl Into<String>, filter: DocFilter) -> Self {
        Self {
            index: index.into(),
            filter,
            sort: SortKey::DocOrder,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn sorted_by(mut self, sort: SortKey) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }
}

/// One page of hits.
pub type Page = Vec<Document>;

/// Ordered document source.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Stream the query's hits page by page, in sort order.
    fn poll_pages(&self, query: &SearchQuery) -> BoxStream<'static, Result<Page>>;

    /// Record `translation` of a document into `language`.
    async fn add_translation(
        &self,
        index: &str,
        doc_id: &str,
        language: &str,
        translation: String,
    ) -> Result<()>;

    /// Add `tag` to a document unless it's already there.
    async fn add_tag(&self, index: &str, doc_id: &str, tag: &str) -> Result<()>;

    async fn count(&self, query: &SearchQuery) -> Result<usize> {
        self.poll_pages(query)
            .try_fold(0, |n, page| async move { Ok(n + page.len()) })
            .await
    }
}

/// Shared search handle.
pub type SharedSearchIndex = Arc<dyn SearchIndex>;

/// Flatten a page stream into documents.
pub fn hits(pages: BoxStream<'static, Result<Page>>) -> BoxStream<'static, Result<Document>> {
    pages
        .map_ok(|page| futures::stream::iter(page.into_iter().map(Ok::<_, PipelineError>)))
        .try_flatten()
        .boxed()
}

/// Fetch documents by id, in index order. Unknown ids are skipped.
pub async fn fetch_documents(
    search: &dyn SearchIndex,
    index: &str,
    ids: &[String],
) -> Result<Vec<Document>> {
    let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
    let query = SearchQuery::new(index, DocFilter::ids(wanted.iter().copied()));
    hits(search.poll_pages(&query)).try_collect().await
}
