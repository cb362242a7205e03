//! Pipelines module - the concrete multi-stage runs a worker serves.
//!
//! # Key Concepts
//! - Pipeline: plans work, fans it out stage by stage and assembles a response
//! - Stage handlers: registered with the substrate under the stage names the
//!   pipelines dispatch to; model inference is supplied by the application
//!
//! # Pipelines
//! - `ping`: one `pong` on `cpu`, a liveness check
//! - `translate-and-classify`: translate what isn't in the target language
//!   yet, then tag what hasn't been classified yet
//! - `asr.transcription`: preprocess, infer and postprocess audio files

pub mod ping;
pub mod transcription;
pub mod translate_classify;

use std::sync::Arc;

use crate::orchestrator::DynPipeline;

pub use ping::{pong_registration, PingPipeline};
pub use transcription::{
    AsrInputs, AsrPipelineConfig, AsrResponse, InferenceConfig, PreprocessingConfig,
    TranscriptionPipeline,
};
pub use translate_classify::{
    ClassificationConfig, ClassifyDocs, Classifier, TranslateAndClassifyConfig,
    TranslateAndClassifyPipeline, TranslateAndClassifyRequest, TranslateAndClassifyResponse,
    TranslateDocs, TranslationConfig, Translator,
};

/// Queues the built-in stages dispatch to.
pub mod queues {
    pub const CPU: &str = "cpu";
    pub const TRANSLATE_GPU: &str = "translate-gpu";
    pub const CLASSIFY_GPU: &str = "classify-gpu";
    pub const ASR: &str = "asr";
}

/// Every built-in pipeline, reading the index with pages of `page_size`.
pub fn builtin_pipelines(page_size: usize) -> Vec<Arc<dyn DynPipeline>> {
    vec![
        Arc::new(PingPipeline) as Arc<dyn DynPipeline>,
        Arc::new(TranslateAndClassifyPipeline::new().with_page_size(page_size)),
        Arc::new(TranscriptionPipeline),
    ]
}
