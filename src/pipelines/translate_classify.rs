//! Translate a project's documents into one language, then classify them.
//!
//! Translation batches are planned from the untranslated documents sorted
//! by language and never mix two source languages, so a handler loads one
//! model per batch. Classification runs once every translation batch has
//! settled, over whatever is readable in the target language by then.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::queues;
use crate::error::{PipelineError, Result};
use crate::orchestrator::{Orchestrator, Pipeline, Unit};
use crate::search::{
    classification_tag, fetch_documents, hits, DocFilter, Document, SearchIndex, SearchQuery,
    SharedSearchIndex, SortKey, DEFAULT_PAGE_SIZE,
};
use crate::stream::{Batch, BatchPlanner};
use crate::substrate::{Handler, PipelineStage, Registration, StageHandler, UnitContext};

pub const TRANSLATE_DOCS_STAGE: &str = "translate-docs";
pub const CLASSIFY_DOCS_STAGE: &str = "classify-docs";

/// Translation batches hold this many model batches.
const TRANSLATION_BATCHES_PER_TASK: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    /// Model family, completed with the language pair by the translator.
    pub model: String,
    pub batch_size: usize,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            model: "Helsinki-NLP/opus-mt".to_string(),
            batch_size: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    pub model: String,
    pub batch_size: usize,
    /// Model batches handled by one unit of work.
    pub batches_per_task: usize,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            model: "distilbert/distilbert-base-uncased-finetuned-sst-2-english".to_string(),
            batch_size: 16,
            batches_per_task: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslateAndClassifyConfig {
    pub translation: TranslationConfig,
    pub classification: ClassificationConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslateAndClassifyRequest {
    pub project: String,
    /// Target language of translations, and language classified in.
    pub language: String,
    #[serde(default)]
    pub config: TranslateAndClassifyConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslateAndClassifyResponse {
    pub translated: u64,
    pub classified: u64,
}

/// Machine translation, supplied by the application. Runs on a blocking thread.
pub trait Translator: Send + Sync + 'static {
    /// Translate `texts`, returning one translation per text in order.
    fn translate(
        &self,
        config: &TranslationConfig,
        source_language: &str,
        target_language: &str,
        texts: Vec<String>,
    ) -> anyhow::Result<Vec<String>>;
}

/// Text classification, supplied by the application. Runs on a blocking thread.
pub trait Classifier: Send + Sync + 'static {
    /// Label `texts`, returning one label per text in order.
    fn classify(&self, config: &ClassificationConfig, texts: Vec<String>)
        -> anyhow::Result<Vec<String>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TranslateDocsArgs {
    docs: Vec<String>,
    target_language: String,
    project: String,
    config: TranslationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClassifyDocsArgs {
    docs: Vec<String>,
    language: String,
    project: String,
    config: ClassificationConfig,
}

fn translate_stage() -> PipelineStage {
    PipelineStage::new(TRANSLATE_DOCS_STAGE, queues::TRANSLATE_GPU)
        .with_timeout(Duration::from_secs(60 * 60))
}

fn classify_stage() -> PipelineStage {
    PipelineStage::new(CLASSIFY_DOCS_STAGE, queues::CLASSIFY_GPU)
        .with_timeout(Duration::from_secs(24 * 60 * 60))
}

fn check_outputs(kind: &str, outputs: usize, inputs: usize) -> anyhow::Result<()> {
    if outputs != inputs {
        anyhow::bail!(
            "{} returned {} results for {} documents",
            kind,
            outputs,
            inputs
        );
    }
    Ok(())
}

/// Stops a unit between model batches once its run is cancelled.
fn ensure_running(ctx: &UnitContext) -> Result<()> {
    if ctx.cancel.is_cancelled() {
        return Err(PipelineError::Cancelled(ctx.run_id.clone()));
    }
    Ok(())
}

/// `translate-docs`: translates a batch of documents and stores the
/// translations. Returns the number of documents in the batch.
pub struct TranslateDocs {
    search: SharedSearchIndex,
    translator: Arc<dyn Translator>,
}

impl TranslateDocs {
    pub fn new(search: SharedSearchIndex, translator: Arc<dyn Translator>) -> Self {
        Self { search, translator }
    }

    pub fn registration(self) -> Registration {
        Registration::new(TRANSLATE_DOCS_STAGE, Handler::Async(Arc::new(self)))
    }

    async fn translate_batch(&self, args: &TranslateDocsArgs, batch: &[String]) -> anyhow::Result<()> {
        let docs = fetch_documents(self.search.as_ref(), &args.project, batch).await?;
        // Batches never span two languages
        let Some(source_language) = docs.first().map(|d| d.language.clone()) else {
            return Ok(());
        };
        let contents: Vec<String> = docs.iter().map(|d| d.content.clone()).collect();
        let translator = self.translator.clone();
        let config = args.config.clone();
        let target = args.target_language.clone();
        let translations = tokio::task::spawn_blocking(move || {
            translator.translate(&config, &source_language, &target, contents)
        })
        .await??;
        check_outputs("translator", translations.len(), docs.len())?;
        for (doc, translation) in docs.iter().zip(translations) {
            self.search
                .add_translation(&args.project, &doc.id, &args.target_language, translation)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StageHandler for TranslateDocs {
    async fn handle(&self, ctx: UnitContext, args: Value) -> anyhow::Result<Value> {
        let args: TranslateDocsArgs = serde_json::from_value(args)?;
        let n_docs = args.docs.len();
        if n_docs == 0 {
            return Ok(json!(0));
        }
        let progress = ctx.progress.clone().raw(n_docs as u64)?;
        let mut seen = 0;
        for batch in BatchPlanner::new(args.config.batch_size)?.chunk(args.docs.iter().cloned()) {
            ensure_running(&ctx)?;
            self.translate_batch(&args, &batch).await?;
            seen += batch.len();
            progress.report_count(seen as u64).await?;
        }
        tracing::debug!(
            task_id = %ctx.task_id,
            project = %args.project,
            "Translated {} documents to {}",
            n_docs,
            args.target_language
        );
        Ok(json!(n_docs))
    }
}

/// `classify-docs`: labels a batch of documents and tags them with
/// `classified:<model>:<label>`. Returns the number of documents in the batch.
pub struct ClassifyDocs {
    search: SharedSearchIndex,
    classifier: Arc<dyn Classifier>,
}

impl ClassifyDocs {
    pub fn new(search: SharedSearchIndex, classifier: Arc<dyn Classifier>) -> Self {
        Self { search, classifier }
    }

    pub fn registration(self) -> Registration {
        Registration::new(CLASSIFY_DOCS_STAGE, Handler::Async(Arc::new(self)))
    }

    async fn classify_batch(&self, args: &ClassifyDocsArgs, batch: &[String]) -> anyhow::Result<()> {
        let docs = fetch_documents(self.search.as_ref(), &args.project, batch).await?;
        // Documents unreadable in the language are skipped
        let (docs, contents): (Vec<&Document>, Vec<String>) = docs
            .iter()
            .filter_map(|d| d.content_in(&args.language).map(|c| (d, c.to_string())))
            .unzip();
        if docs.is_empty() {
            return Ok(());
        }
        let classifier = self.classifier.clone();
        let config = args.config.clone();
        let labels =
            tokio::task::spawn_blocking(move || classifier.classify(&config, contents)).await??;
        check_outputs("classifier", labels.len(), docs.len())?;
        for (doc, label) in docs.iter().zip(labels) {
            let tag = classification_tag(&args.config.model, &label);
            self.search.add_tag(&args.project, &doc.id, &tag).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StageHandler for ClassifyDocs {
    async fn handle(&self, ctx: UnitContext, args: Value) -> anyhow::Result<Value> {
        let args: ClassifyDocsArgs = serde_json::from_value(args)?;
        let n_docs = args.docs.len();
        if n_docs == 0 {
            return Ok(json!(0));
        }
        let progress = ctx.progress.clone().raw(n_docs as u64)?;
        let mut seen = 0;
        for batch in BatchPlanner::new(args.config.batch_size)?.chunk(args.docs.iter().cloned()) {
            ensure_running(&ctx)?;
            self.classify_batch(&args, &batch).await?;
            seen += batch.len();
            progress.report_count(seen as u64).await?;
        }
        tracing::debug!(
            task_id = %ctx.task_id,
            project = %args.project,
            model = %args.config.model,
            "Classified {} documents",
            n_docs
        );
        Ok(json!(n_docs))
    }
}

/// `translate-and-classify`: translation fan-out, barrier, then
/// classification fan-out.
#[derive(Debug, Clone)]
pub struct TranslateAndClassifyPipeline {
    page_size: usize,
}

impl Default for TranslateAndClassifyPipeline {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl TranslateAndClassifyPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Ids of documents to translate, by language then index order, in
    /// batches of `batch_size * 4` that never mix languages.
    pub async fn plan_translation(
        &self,
        search: &dyn SearchIndex,
        request: &TranslateAndClassifyRequest,
    ) -> Result<Vec<Batch<String>>> {
        let query = SearchQuery::new(
            &request.project,
            DocFilter::Untranslated {
                target: request.language.clone(),
            },
        )
        .sorted_by(SortKey::Language)
        .with_page_size(self.page_size);
        let planner = BatchPlanner::new(
            request
                .config
                .translation
                .batch_size
                .saturating_mul(TRANSLATION_BATCHES_PER_TASK),
        )?;
        let batches = planner
            .plan_grouped(hits(search.poll_pages(&query)), |doc: &Document| {
                doc.language.clone()
            })
            .await?;
        Ok(batches
            .into_iter()
            .map(|batch| batch.into_iter().map(|doc| doc.id).collect())
            .collect())
    }

    /// Ids of documents `model` hasn't tagged yet and that are readable in
    /// the request language, in index order.
    pub async fn plan_classification(
        &self,
        search: &dyn SearchIndex,
        request: &TranslateAndClassifyRequest,
    ) -> Result<Vec<Batch<String>>> {
        let config = &request.config.classification;
        let query = SearchQuery::new(
            &request.project,
            DocFilter::Unclassified {
                model: config.model.clone(),
                language: request.language.clone(),
            },
        )
        .with_page_size(self.page_size);
        let planner = BatchPlanner::new(config.batch_size.saturating_mul(config.batches_per_task))?;
        planner
            .chunk_stream(hits(search.poll_pages(&query)).map_ok(|doc| doc.id))
            .try_collect()
            .await
    }
}

fn units<A>(batches: Vec<Batch<String>>, args: impl Fn(Batch<String>) -> A) -> Vec<Unit<A>> {
    batches
        .into_iter()
        .map(|batch| {
            let size = batch.len();
            Unit::sized(args(batch), size)
        })
        .collect()
}

#[async_trait]
impl Pipeline for TranslateAndClassifyPipeline {
    type Request = TranslateAndClassifyRequest;
    type Response = TranslateAndClassifyResponse;

    fn name(&self) -> &'static str {
        "translate-and-classify"
    }

    async fn execute(
        &self,
        orchestrator: &Orchestrator<'_>,
        request: TranslateAndClassifyRequest,
    ) -> Result<TranslateAndClassifyResponse> {
        let search = orchestrator.context().search()?;

        let batches = self.plan_translation(search, &request).await?;
        tracing::info!(
            project = %request.project,
            language = %request.language,
            "Planned {} translation batches",
            batches.len()
        );
        let translation_units = units(batches, |docs| TranslateDocsArgs {
            docs,
            target_language: request.language.clone(),
            project: request.project.clone(),
            config: request.config.translation.clone(),
        });
        let translated: Vec<u64> = orchestrator
            .fan_out(&translate_stage(), translation_units)
            .await?;
        let translated = translated.into_iter().sum();

        orchestrator.begin_planning()?;
        let batches = self.plan_classification(search, &request).await?;
        tracing::info!(
            project = %request.project,
            model = %request.config.classification.model,
            "Planned {} classification batches",
            batches.len()
        );
        let classification_units = units(batches, |docs| ClassifyDocsArgs {
            docs,
            language: request.language.clone(),
            project: request.project.clone(),
            config: request.config.classification.clone(),
        });
        let classified: Vec<u64> = orchestrator
            .fan_out(&classify_stage(), classification_units)
            .await?;
        let classified = classified.into_iter().sum();

        Ok(TranslateAndClassifyResponse {
            translated,
            classified,
        })
    }

    fn processed(&self, response: &TranslateAndClassifyResponse) -> Option<u64> {
        Some(response.translated + response.classified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{run_pipeline, RunContext, RunStatus};
    use crate::progress::ProgressAggregator;
    use crate::search::InMemoryIndex;
    use crate::substrate::{HandlerRegistry, LocalSubstrate};
    use crate::task::InMemoryTaskRegistry;

    /// Prefixes texts with the language pair, failing for `fail_on`.
    struct FakeTranslator {
        fail_on: Option<&'static str>,
    }

    impl Translator for FakeTranslator {
        fn translate(
            &self,
            _config: &TranslationConfig,
            source_language: &str,
            target_language: &str,
            texts: Vec<String>,
        ) -> anyhow::Result<Vec<String>> {
            if Some(source_language) == self.fail_on {
                anyhow::bail!("no model for {}", source_language);
            }
            Ok(texts
                .into_iter()
                .map(|t| format!("[{}->{}] {}", source_language, target_language, t))
                .collect())
        }
    }

    /// Labels texts by length.
    struct LengthClassifier;

    impl Classifier for LengthClassifier {
        fn classify(
            &self,
            _config: &ClassificationConfig,
            texts: Vec<String>,
        ) -> anyhow::Result<Vec<String>> {
            Ok(texts
                .into_iter()
                .map(|t| if t.len() > 20 { "long" } else { "short" }.to_string())
                .collect())
        }
    }

    async fn index() -> InMemoryIndex {
        let index = InMemoryIndex::new();
        index
            .index_documents(
                "project",
                vec![
                    Document::new("a", "bonjour", "FRENCH"),
                    Document::new("b", "hello there, how are you", "ENGLISH"),
                    Document::new("c", "hallo", "GERMAN"),
                    Document::new("d", "salut", "FRENCH"),
                    Document::new("e", "au revoir", "FRENCH"),
                ],
            )
            .await;
        index
    }

    fn request() -> TranslateAndClassifyRequest {
        TranslateAndClassifyRequest {
            project: "project".to_string(),
            language: "ENGLISH".to_string(),
            config: TranslateAndClassifyConfig {
                translation: TranslationConfig {
                    batch_size: 1,
                    ..Default::default()
                },
                classification: ClassificationConfig {
                    model: "sentiment".to_string(),
                    batch_size: 1,
                    batches_per_task: 2,
                },
            },
        }
    }

    fn context(index: &InMemoryIndex, translator: FakeTranslator) -> RunContext {
        let search: SharedSearchIndex = Arc::new(index.clone());
        let handlers = HandlerRegistry::new()
            .with(TranslateDocs::new(search.clone(), Arc::new(translator)).registration())
            .unwrap()
            .with(ClassifyDocs::new(search.clone(), Arc::new(LengthClassifier)).registration())
            .unwrap();
        let progress = Arc::new(ProgressAggregator::new());
        let substrate = LocalSubstrate::new(
            handlers,
            vec![("translate-gpu", 2), ("classify-gpu", 2)],
            Arc::new(InMemoryTaskRegistry::new()),
            progress.clone(),
        )
        .unwrap();
        RunContext::builder()
            .search(search)
            .substrate(Arc::new(substrate))
            .progress(progress)
            .build()
    }

    #[tokio::test]
    async fn test_translation_batches_never_mix_languages() {
        let index = index().await;
        let batches = TranslateAndClassifyPipeline::new()
            .with_page_size(2)
            .plan_translation(&index, &request())
            .await
            .unwrap();
        let ids = |b: &[&str]| b.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(batches, vec![ids(&["a", "d", "e"]), ids(&["c"])]);
    }

    #[tokio::test]
    async fn test_classification_batches_in_index_order() {
        let index = index().await;
        let batches = TranslateAndClassifyPipeline::new()
            .plan_classification(&index, &request())
            .await
            .unwrap();
        // Only the English document is readable before translation
        assert_eq!(batches, vec![vec!["b".to_string()]]);
    }

    #[tokio::test]
    async fn test_zero_batch_size_is_rejected() {
        let index = index().await;
        let mut request = request();
        request.config.translation.batch_size = 0;
        let err = TranslateAndClassifyPipeline::new()
            .plan_translation(&index, &request)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_translate_then_classify() {
        let index = index().await;
        let ctx = context(&index, FakeTranslator { fail_on: None });
        let pipeline = TranslateAndClassifyPipeline::new();

        let outcome = run_pipeline(&ctx, &pipeline, request()).await;
        assert!(outcome.is_success(), "{:?}", outcome.error);
        assert_eq!(
            outcome.payload,
            Some(json!({"translated": 4, "classified": 5}))
        );
        assert_eq!(outcome.processed, Some(9));
        assert_eq!(outcome.progress.rate(), 1.0);

        let a = index.get("project", "a").await.unwrap();
        assert_eq!(
            a.content_translated.get("ENGLISH").map(String::as_str),
            Some("[FRENCH->ENGLISH] bonjour")
        );
        assert_eq!(a.tags, vec!["classified:sentiment:long"]);
        let b = index.get("project", "b").await.unwrap();
        assert!(b.content_translated.is_empty());
        assert_eq!(b.tags, vec!["classified:sentiment:long"]);

        // Nothing left to do the second time
        let ctx = context(&index, FakeTranslator { fail_on: None });
        let outcome = run_pipeline(&ctx, &pipeline, request()).await;
        assert_eq!(
            outcome.payload,
            Some(json!({"translated": 0, "classified": 0}))
        );
    }

    #[tokio::test]
    async fn test_failed_translation_batch_fails_run() {
        let index = index().await;
        let ctx = context(
            &index,
            FakeTranslator {
                fail_on: Some("GERMAN"),
            },
        );
        let outcome = run_pipeline(&ctx, &TranslateAndClassifyPipeline::new(), request()).await;
        assert_eq!(outcome.status, RunStatus::Error);
        assert_eq!(outcome.error.as_deref(), Some("no model for GERMAN"));

        // The French batch still went through, classification never started
        let a = index.get("project", "a").await.unwrap();
        assert!(a.content_translated.contains_key("ENGLISH"));
        assert!(a.tags.is_empty());
        let b = index.get("project", "b").await.unwrap();
        assert!(b.tags.is_empty());
    }

    #[tokio::test]
    async fn test_missing_search_index() {
        let ctx = RunContext::builder().build();
        let outcome = run_pipeline(&ctx, &TranslateAndClassifyPipeline::new(), request()).await;
        assert_eq!(outcome.error.as_deref(), Some("search index was not injected"));
    }

    #[test]
    fn test_request_defaults() {
        let request: TranslateAndClassifyRequest =
            serde_json::from_value(json!({"project": "p", "language": "ENGLISH"})).unwrap();
        assert_eq!(request.config.translation.batch_size, 16);
        assert_eq!(request.config.classification.batches_per_task, 5);
    }
}
