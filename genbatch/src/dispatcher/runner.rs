use std::{path::PathBuf, sync::Arc};

use futures::future::try_join_all;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{instrument, Instrument};

use crate::{
    collaborators::{
        ApiError, CollaboratorError, Collaborators, GenerationRequest, ReferenceDescriptor,
        ReferenceImage, SavedFile,
    },
    job::{BatchError, BatchId, JobId, PromptConfig},
    model::ModelConfig,
};

/// What a successful batch produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutput {
    pub files: Vec<SavedFile>,
    /// The prompt after processing.
    pub prompt: String,
    pub references: Vec<ReferenceDescriptor>,
    pub output_dir: PathBuf,
}

/// Why a batch failed.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("Model {0} is not configured")]
    MissingModel(String),
    #[error("Failed to process prompt: {0}")]
    Prompt(#[source] CollaboratorError),
    #[error("Failed to compress reference image {path:?}: {source}")]
    Compression {
        path: PathBuf,
        #[source]
        source: CollaboratorError,
    },
    #[error("Batch execution panicked: {0}")]
    Panic(String),
}

impl ExecutionError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api(error) => error.status,
            _ => None,
        }
    }

    pub(crate) fn to_batch_error(&self, batch_index: u32) -> BatchError {
        let (details, hint) = match self {
            Self::Api(error) => (error.details.clone(), error.hint()),
            Self::Prompt(error) | Self::Compression { source: error, .. } => {
                (error.details.clone(), None)
            }
            Self::MissingModel(_) => (None, Some("Add the model to the registry".to_owned())),
            Self::Panic(_) => (None, None),
        };
        BatchError {
            message: self.to_string(),
            code: self.status(),
            details,
            hint,
            batch_index,
        }
    }
}

impl From<JoinError> for ExecutionError {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self::Panic(message)
    }
}

/// Everything needed to run one batch, captured when the batch is admitted.
#[derive(Debug, Clone)]
pub(crate) struct BatchTask {
    pub(crate) batch_id: BatchId,
    pub(crate) job_id: JobId,
    pub(crate) index: u32,
    pub(crate) images_per_batch: u32,
    pub(crate) prompt: PromptConfig,
    pub(crate) model_id: String,
    pub(crate) model: Option<ModelConfig>,
    pub(crate) references: Arc<Vec<PathBuf>>,
    pub(crate) byte_budget: usize,
    pub(crate) output_dir: PathBuf,
    pub(crate) filename_prefix: String,
}

pub(crate) struct BatchRunner {
    collaborators: Collaborators,
}

impl BatchRunner {
    pub(crate) fn new(collaborators: Collaborators) -> Self {
        Self { collaborators }
    }

    /// Runs the batch on its own task so a panicking collaborator is reported as a failure of
    /// the batch.
    #[instrument(skip(self, task), fields(job_id = %task.job_id, batch_id = %task.batch_id))]
    pub(crate) async fn run(&self, task: BatchTask) -> Result<BatchOutput, ExecutionError> {
        let batch_id = task.batch_id;
        tracing::debug!(%batch_id, "Executing batch {batch_id}");
        let fut = execute(self.collaborators.clone(), task).in_current_span();
        match tokio::spawn(fut).await {
            Ok(result) => result,
            Err(error) => Err(error.into()),
        }
    }
}

async fn execute(
    collaborators: Collaborators,
    task: BatchTask,
) -> Result<BatchOutput, ExecutionError> {
    let prompt = collaborators
        .prompts
        .process(&task.prompt, task.index)
        .await
        .map_err(ExecutionError::Prompt)?;

    let compressor = &collaborators.compressor;
    let byte_budget = task.byte_budget;
    let references = try_join_all(task.references.iter().map(|path| async move {
        let compressed = compressor
            .compress_image(path, byte_budget)
            .await
            .map_err(|source| ExecutionError::Compression {
                path: path.clone(),
                source,
            })?;
        Ok::<_, ExecutionError>(ReferenceImage {
            path: path.clone(),
            base64: compressed.base64,
            metadata: compressed.metadata,
        })
    }))
    .await?;

    let model = task
        .model
        .ok_or_else(|| ExecutionError::MissingModel(task.model_id.clone()))?;

    let descriptors = references
        .iter()
        .map(|reference| ReferenceDescriptor {
            path: reference.path.clone(),
            metadata: reference.metadata.clone(),
        })
        .collect();
    let request = GenerationRequest {
        model: model.name,
        prompt: prompt.clone(),
        image_count: task.images_per_batch,
        references,
        width: model.width,
        height: model.height,
        parameters: model.parameters,
    };
    let filename_prefix = format!("{}_b{}", task.filename_prefix, task.index);

    let files = collaborators
        .api
        .generate_and_save(request, &task.output_dir, &filename_prefix)
        .await?;

    Ok(BatchOutput {
        files,
        prompt,
        references: descriptors,
        output_dir: task.output_dir,
    })
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        collaborators::{MockImageApi, MockImageCompressor, MockPromptProcessor},
        testing::{self, ScriptedApi, StaticResolver},
    };

    fn task() -> BatchTask {
        BatchTask {
            batch_id: 7.into(),
            job_id: 1.into(),
            index: 2,
            images_per_batch: 2,
            prompt: PromptConfig::from("a {colour} cat").with_variable("colour", "black"),
            model_id: "flash".to_owned(),
            model: Some(ModelConfig::new("flash-image-001").with_size(512, 512)),
            references: Arc::new(vec![PathBuf::from("refs/a.png"), PathBuf::from("refs/b.png")]),
            byte_budget: 1_024,
            output_dir: PathBuf::from("out/entry"),
            filename_prefix: "cat".to_owned(),
        }
    }

    #[tokio::test]
    async fn builds_the_request_from_the_task() {
        let api = Arc::new(ScriptedApi::new());
        let runner = BatchRunner::new(testing::collaborators(api.clone()));

        let output = runner.run(task()).await.unwrap();

        let calls = api.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].filename_prefix, "cat_b2");
        assert_eq!(calls[0].output_dir, PathBuf::from("out/entry"));
        assert_eq!(calls[0].request.model, "flash-image-001");
        assert_eq!(calls[0].request.prompt, "a black cat");
        assert_eq!(calls[0].request.image_count, 2);
        assert_eq!(calls[0].request.width, Some(512));
        assert_eq!(calls[0].request.references.len(), 2);
        assert_eq!(output.files.len(), 2);
        assert_eq!(output.prompt, "a black cat");
        assert_eq!(output.references[1].path, PathBuf::from("refs/b.png"));
    }

    #[tokio::test]
    async fn missing_model_fails_without_calling_the_api() {
        let mut api = MockImageApi::new();
        api.expect_generate_and_save().never();
        let runner = BatchRunner::new(testing::collaborators(Arc::new(api)));

        let result = runner.run(BatchTask { model: None, ..task() }).await;

        assert_matches!(result, Err(ExecutionError::MissingModel(model)) if model == "flash");
    }

    #[tokio::test]
    async fn compression_failure_names_the_image() {
        let mut compressor = MockImageCompressor::new();
        compressor
            .expect_compress_image()
            .returning(|_, _| Err(CollaboratorError::new("corrupt")));
        let collaborators = Collaborators::new(
            Arc::new(ScriptedApi::new()),
            Arc::new(compressor),
            Arc::new(StaticResolver::new()),
            Arc::new(testing::TemplatePrompts),
        );

        let result = BatchRunner::new(collaborators).run(task()).await;

        assert_matches!(result, Err(ExecutionError::Compression { source, .. }) if source.message == "corrupt");
    }

    #[tokio::test]
    async fn panics_become_execution_errors() {
        let mut prompts = MockPromptProcessor::new();
        prompts.expect_process().returning(|_, _| panic!("prompt exploded"));
        let collaborators = Collaborators::new(
            Arc::new(ScriptedApi::new()),
            Arc::new(testing::PassthroughCompressor),
            Arc::new(StaticResolver::new()),
            Arc::new(prompts),
        );

        let result = BatchRunner::new(collaborators).run(task()).await;

        assert_matches!(result, Err(ExecutionError::Panic(message)) if message == "prompt exploded");
    }

    #[test]
    fn batch_errors_keep_status_and_hint() {
        let error: ExecutionError = ApiError::new("overloaded")
            .with_status(503)
            .with_details("try later")
            .into();

        let batch_error = error.to_batch_error(4);

        assert_eq!(batch_error.message, "overloaded");
        assert_eq!(batch_error.code, Some(503));
        assert_eq!(batch_error.details.as_deref(), Some("try later"));
        assert!(batch_error.hint.is_some());
        assert_eq!(batch_error.batch_index, 4);
    }
}
