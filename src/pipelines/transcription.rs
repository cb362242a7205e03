//! Speech recognition over audio files.
//!
//! Three stages on the `asr` queue. `preprocess` takes a chunk of file
//! paths and returns the inputs split into inner batches; `infer` runs on
//! each inner batch; `postprocess` runs once per preprocessing chunk over
//! that chunk's inference results. Handlers are supplied by the
//! application: inputs and results are opaque JSON here.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::queues;
use crate::error::Result;
use crate::orchestrator::{Orchestrator, Pipeline, RunOutcome, RunStatus, Unit};
use crate::stream::BatchPlanner;
use crate::substrate::PipelineStage;

pub const PREPROCESS_STAGE: &str = "preprocess";
pub const INFER_STAGE: &str = "infer";
pub const POSTPROCESS_STAGE: &str = "postprocess";

/// Field of a transcription that only matters for reordering.
const INPUT_ORDERING: &str = "input_ordering";

const ASR_TIMEOUT: Duration = Duration::from_secs(10 * 60);

const RESPONSE_SUCCESS: &str = "success";
const RESPONSE_ERROR: &str = "error";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessingConfig {
    pub batch_size: usize,
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self { batch_size: 32 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub batch_size: usize,
    pub model_name: String,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            model_name: "parakeet".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsrPipelineConfig {
    pub preprocessing: PreprocessingConfig,
    pub inference: InferenceConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsrInputs {
    pub file_paths: Vec<String>,
    #[serde(default)]
    pub pipeline: AsrPipelineConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsrResponse {
    pub status: String,
    #[serde(default)]
    pub transcriptions: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AsrResponse {
    pub fn success(transcriptions: Vec<Value>) -> Self {
        Self {
            status: RESPONSE_SUCCESS.to_string(),
            transcriptions,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: RESPONSE_ERROR.to_string(),
            transcriptions: Vec::new(),
            error: Some(message.into()),
        }
    }

    /// The response callers of `asr.transcription` expect for a finished run.
    pub fn from_outcome(outcome: &RunOutcome) -> Self {
        match (outcome.status, &outcome.payload) {
            (RunStatus::Success, Some(payload)) => serde_json::from_value(payload.clone())
                .unwrap_or_else(|e| Self::error(format!("invalid transcription payload: {}", e))),
            (RunStatus::Success, None) => Self::error("missing transcription payload"),
            (RunStatus::Error, _) => {
                Self::error(outcome.error.clone().unwrap_or_else(|| "unknown error".to_string()))
            }
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RESPONSE_SUCCESS
    }
}

fn asr_stage(name: &str) -> PipelineStage {
    PipelineStage::new(name, queues::ASR).with_timeout(ASR_TIMEOUT)
}

fn drop_input_ordering(mut transcription: Value) -> Value {
    if let Value::Object(fields) = &mut transcription {
        fields.remove(INPUT_ORDERING);
    }
    transcription
}

/// `asr.transcription`: preprocess, infer, postprocess.
#[derive(Debug, Clone, Copy, Default)]
pub struct TranscriptionPipeline;

#[async_trait]
impl Pipeline for TranscriptionPipeline {
    type Request = AsrInputs;
    type Response = AsrResponse;

    fn name(&self) -> &'static str {
        "asr.transcription"
    }

    async fn execute(&self, orchestrator: &Orchestrator<'_>, inputs: AsrInputs) -> Result<AsrResponse> {
        let planner = BatchPlanner::new(inputs.pipeline.preprocessing.batch_size)?;
        let chunks = planner.chunk(inputs.file_paths);
        let units = chunks
            .into_iter()
            .map(|paths| {
                let size = paths.len();
                Unit::sized(paths, size)
            })
            .collect();
        let preprocessed: Vec<Vec<Vec<Value>>> = orchestrator
            .fan_out(&asr_stage(PREPROCESS_STAGE), units)
            .await?;
        tracing::info!("Preprocessing complete");

        // Every inner batch is inferred at once; results are regrouped by
        // the preprocessing chunk they came from.
        let owners: Vec<usize> = preprocessed
            .iter()
            .enumerate()
            .flat_map(|(outer, inner)| std::iter::repeat(outer).take(inner.len()))
            .collect();
        let outer_count = preprocessed.len();
        let units = preprocessed
            .into_iter()
            .flatten()
            .map(|batch| {
                let size = batch.len();
                Unit::sized(batch, size)
            })
            .collect();
        orchestrator.begin_planning()?;
        let inferred: Vec<Vec<Value>> = orchestrator
            .fan_out(&asr_stage(INFER_STAGE), units)
            .await?;
        let mut per_chunk: Vec<Vec<Value>> = vec![Vec::new(); outer_count];
        for (outer, results) in owners.into_iter().zip(inferred) {
            per_chunk[outer].extend(results);
        }
        tracing::info!("Inference complete");

        orchestrator.begin_planning()?;
        let units = per_chunk
            .into_iter()
            .map(|results| {
                let size = results.len();
                Unit::sized(results, size)
            })
            .collect();
        let postprocessed: Vec<Vec<Value>> = orchestrator
            .fan_out(&asr_stage(POSTPROCESS_STAGE), units)
            .await?;
        let transcriptions = postprocessed
            .into_iter()
            .flatten()
            .map(drop_input_ordering)
            .collect();
        tracing::info!("Postprocessing complete");

        Ok(AsrResponse::success(transcriptions))
    }

    fn processed(&self, response: &AsrResponse) -> Option<u64> {
        Some(response.transcriptions.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{run_pipeline, RunContext};
    use crate::progress::ProgressAggregator;
    use crate::substrate::{async_handler, blocking_handler, HandlerRegistry, LocalSubstrate, Registration};
    use crate::task::InMemoryTaskRegistry;
    use serde_json::json;
    use std::sync::Arc;

    /// Fake stages: preprocessing splits each chunk into inner batches of
    /// two, inference transcribes, postprocessing reverses the order.
    fn handlers() -> HandlerRegistry {
        HandlerRegistry::new()
            .with(Registration::new(
                PREPROCESS_STAGE,
                blocking_handler(|_, args| {
                    let paths: Vec<String> = serde_json::from_value(args)?;
                    if paths.iter().any(|p| !p.ends_with(".wav")) {
                        anyhow::bail!("unsupported audio format");
                    }
                    let inner: Vec<Vec<Value>> = paths
                        .chunks(2)
                        .map(|c| c.iter().map(|p| json!({"path": p})).collect())
                        .collect();
                    Ok(serde_json::to_value(inner)?)
                }),
            ))
            .unwrap()
            .with(Registration::new(
                INFER_STAGE,
                async_handler(|_, args| async move {
                    let inputs: Vec<Value> = serde_json::from_value(args)?;
                    let results: Vec<Value> = inputs
                        .iter()
                        .map(|i| json!({"transcription": format!("text of {}", i["path"].as_str().unwrap_or("")), "input_ordering": 0}))
                        .collect();
                    Ok(Value::Array(results))
                }),
            ))
            .unwrap()
            .with(Registration::new(
                POSTPROCESS_STAGE,
                async_handler(|_, args| async move {
                    let mut results: Vec<Value> = serde_json::from_value(args)?;
                    results.reverse();
                    Ok(Value::Array(results))
                }),
            ))
            .unwrap()
    }

    fn context() -> RunContext {
        let progress = Arc::new(ProgressAggregator::new());
        let substrate = LocalSubstrate::new(
            handlers(),
            vec![("asr", 2)],
            Arc::new(InMemoryTaskRegistry::new()),
            progress.clone(),
        )
        .unwrap();
        RunContext::builder()
            .substrate(Arc::new(substrate))
            .progress(progress)
            .build()
    }

    fn inputs(paths: &[&str], batch_size: usize) -> AsrInputs {
        AsrInputs {
            file_paths: paths.iter().map(|p| p.to_string()).collect(),
            pipeline: AsrPipelineConfig {
                preprocessing: PreprocessingConfig { batch_size },
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_transcriptions_in_dispatch_order() {
        let ctx = context();
        let outcome = run_pipeline(
            &ctx,
            &TranscriptionPipeline,
            inputs(&["a.wav", "b.wav", "c.wav", "d.wav", "e.wav"], 3),
        )
        .await;
        assert!(outcome.is_success(), "{:?}", outcome.error);
        assert_eq!(outcome.processed, Some(5));

        let response = AsrResponse::from_outcome(&outcome);
        assert!(response.is_success());
        let texts: Vec<&str> = response
            .transcriptions
            .iter()
            .map(|t| t["transcription"].as_str().unwrap())
            .collect();
        // Chunks [a, b, c] and [d, e], each reversed by postprocessing
        assert_eq!(
            texts,
            vec![
                "text of c.wav",
                "text of b.wav",
                "text of a.wav",
                "text of e.wav",
                "text of d.wav"
            ]
        );
        assert!(response
            .transcriptions
            .iter()
            .all(|t| t.get(INPUT_ORDERING).is_none()));
    }

    #[tokio::test]
    async fn test_no_files() {
        let outcome = run_pipeline(&context(), &TranscriptionPipeline, inputs(&[], 3)).await;
        let response = AsrResponse::from_outcome(&outcome);
        assert!(response.is_success());
        assert!(response.transcriptions.is_empty());
    }

    #[tokio::test]
    async fn test_failure_becomes_error_response() {
        let outcome = run_pipeline(
            &context(),
            &TranscriptionPipeline,
            inputs(&["a.wav", "b.mp3"], 1),
        )
        .await;
        let response = AsrResponse::from_outcome(&outcome);
        assert_eq!(response.status, "error");
        assert_eq!(
            response.error.as_deref(),
            Some("unsupported audio format")
        );
        assert!(response.transcriptions.is_empty());
    }

    #[test]
    fn test_defaults() {
        let inputs: AsrInputs = serde_json::from_value(json!({"file_paths": ["a.wav"]})).unwrap();
        assert_eq!(inputs.pipeline.preprocessing.batch_size, 32);
        assert_eq!(inputs.pipeline.inference.batch_size, 32);
        assert_eq!(inputs.pipeline.inference.model_name, "parakeet");
    }
}
