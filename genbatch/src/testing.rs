//! Helpers for testing.
//!
//! Scripted implementations of every collaborator so a [`crate::Dispatcher`] can be exercised
//! without a generation provider or a file system.
//!
//! # Example
//!
//! ```
//! # use std::sync::Arc;
//! # use genbatch::prelude::*;
//! use genbatch::testing::{self, ScriptedApi};
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let api = Arc::new(ScriptedApi::new());
//! api.push_error(ApiError::new("overloaded").with_status(503));
//!
//! let dispatcher = Dispatcher::new(
//!     Arc::new(ConcurrencyLimiter::default()),
//!     Arc::new(RateLimiter::default()),
//!     testing::collaborators(api.clone()),
//! );
//! dispatcher.configure(
//!     DispatcherOptions::default()
//!         .with_model("model", ModelConfig::new("model-v1"))
//!         .with_failure_policy(FailurePolicy::default().with_retry_policy(RetryPolicy {
//!             backoff_ms: 10,
//!             ..Default::default()
//!         })),
//! );
//! let mut events = dispatcher.take_events().unwrap();
//!
//! let job = dispatcher.create_job(JobEntry::fixed("entry", "model", 1)).unwrap();
//! dispatcher.start_job(job.id).await.unwrap();
//! dispatcher.start();
//!
//! while let Some(event) = events.recv().await {
//!     if let DispatcherEvent::JobCompleted { job } = event {
//!         assert_eq!(job.stats.failed_batches, 1);
//!         assert_eq!(job.stats.successful_batches, 1);
//!         break;
//!     }
//! }
//! assert_eq!(api.calls().len(), 2);
//! # });
//! ```
use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    collaborators::{
        ApiError, CollaboratorError, Collaborators, CompressedImage, GenerationRequest, ImageApi,
        ImageCompressor, ImageMetadata, PromptProcessor, ReferenceResolver, SavedFile,
    },
    job::PromptConfig,
};

/// A call received by a [`ScriptedApi`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub request: GenerationRequest,
    pub output_dir: PathBuf,
    pub filename_prefix: String,
}

/// An [`ImageApi`] replaying scripted results in order.
///
/// Once the script runs out every call succeeds, producing `image_count` files.
#[derive(Debug, Default)]
pub struct ScriptedApi {
    script: Mutex<VecDeque<Result<Option<u32>, ApiError>>>,
    calls: Mutex<Vec<RecordedCall>>,
    latency: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call waits `latency` before answering.
    pub fn with_latency(self, latency: Duration) -> Self {
        Self { latency, ..self }
    }

    pub fn push_success(&self) {
        lock(&self.script).push_back(Ok(None));
    }

    /// The next call succeeds with exactly `images` files, whatever was requested.
    pub fn push_images(&self, images: u32) {
        lock(&self.script).push_back(Ok(Some(images)));
    }

    pub fn push_error(&self, error: ApiError) {
        lock(&self.script).push_back(Err(error));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl ImageApi for ScriptedApi {
    async fn generate_and_save(
        &self,
        request: GenerationRequest,
        output_dir: &Path,
        filename_prefix: &str,
    ) -> Result<Vec<SavedFile>, ApiError> {
        let image_count = request.image_count;
        lock(&self.calls).push(RecordedCall {
            request,
            output_dir: output_dir.to_owned(),
            filename_prefix: filename_prefix.to_owned(),
        });
        let next = lock(&self.script).pop_front();
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let images = next.unwrap_or(Ok(None))?.unwrap_or(image_count);
        Ok((0..images)
            .map(|image| SavedFile::new(output_dir.join(format!("{filename_prefix}_{image}.png"))))
            .collect())
    }
}

/// Resolves a pattern to `base_dir/pattern`, or to the paths registered for it.
#[derive(Debug, Default)]
pub struct StaticResolver {
    patterns: HashMap<String, Vec<PathBuf>>,
    failure: Option<CollaboratorError>,
    calls: AtomicUsize,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>, paths: Vec<PathBuf>) -> Self {
        self.patterns.insert(pattern.into(), paths);
        self
    }

    pub fn failing(self, error: CollaboratorError) -> Self {
        Self {
            failure: Some(error),
            ..self
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReferenceResolver for StaticResolver {
    async fn resolve_pattern(
        &self,
        pattern: &str,
        base_dir: &Path,
    ) -> Result<Vec<PathBuf>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        Ok(self
            .patterns
            .get(pattern)
            .cloned()
            .unwrap_or_else(|| vec![base_dir.join(pattern)]))
    }
}

/// Pretends to compress by tagging the path, the byte budget is recorded in the metadata.
#[derive(Debug, Default)]
pub struct PassthroughCompressor;

#[async_trait]
impl ImageCompressor for PassthroughCompressor {
    async fn compress_image(
        &self,
        path: &Path,
        byte_budget: usize,
    ) -> Result<CompressedImage, CollaboratorError> {
        Ok(CompressedImage {
            base64: format!("base64:{}", path.display()),
            metadata: ImageMetadata {
                mime_type: Some("image/png".to_owned()),
                compressed_bytes: Some(byte_budget as u64),
                ..Default::default()
            },
        })
    }
}

/// Substitutes `{name}` placeholders with the prompt variables and `{index}` with the batch
/// index.
#[derive(Debug, Default)]
pub struct TemplatePrompts;

#[async_trait]
impl PromptProcessor for TemplatePrompts {
    async fn process(
        &self,
        prompt: &PromptConfig,
        batch_index: u32,
    ) -> Result<String, CollaboratorError> {
        let text = prompt
            .variables
            .iter()
            .fold(prompt.template.clone(), |text, (name, value)| {
                text.replace(&format!("{{{name}}}"), value)
            });
        Ok(text.replace("{index}", &batch_index.to_string()))
    }
}

/// [`Collaborators`] made of `api` and the default fakes of this module.
pub fn collaborators(api: Arc<dyn ImageApi>) -> Collaborators {
    Collaborators::new(
        api,
        Arc::new(PassthroughCompressor),
        Arc::new(StaticResolver::new()),
        Arc::new(TemplatePrompts),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn template_prompts_substitute_variables() {
        let prompt = PromptConfig {
            template: "a {animal} number {index}".to_owned(),
            variables: [("animal".to_owned(), "fox".to_owned())].into(),
        };

        assert_eq!(
            TemplatePrompts.process(&prompt, 3).await,
            Ok("a fox number 3".to_owned())
        );
    }

    #[tokio::test]
    async fn scripted_api_replays_then_succeeds() {
        let api = ScriptedApi::new();
        api.push_error(ApiError::new("nope").with_status(500));
        api.push_images(1);
        let request = GenerationRequest {
            model: "model".to_owned(),
            prompt: "prompt".to_owned(),
            image_count: 2,
            references: vec![],
            width: None,
            height: None,
            parameters: Default::default(),
        };
        let dir = Path::new("out");

        assert!(api.generate_and_save(request.clone(), dir, "p").await.is_err());
        assert_eq!(api.generate_and_save(request.clone(), dir, "p").await.unwrap().len(), 1);
        assert_eq!(
            api.generate_and_save(request, dir, "p").await.unwrap(),
            vec![SavedFile::new("out/p_0.png"), SavedFile::new("out/p_1.png")]
        );
        assert_eq!(api.calls().len(), 3);
    }
}
