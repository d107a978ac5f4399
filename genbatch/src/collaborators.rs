//! Contracts of the services the dispatcher delegates to.
//!
//! None of these are implemented by this crate. A generation provider client implements
//! [`ImageApi`], and the application supplies the prompt expansion, reference lookup and image
//! compression. [`crate::testing`] has scripted implementations for tests.
use std::{
    fmt::Debug,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::PromptConfig;

/// A file written by [`ImageApi::generate_and_save`].
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct SavedFile {
    pub path: PathBuf,
    pub mime_type: Option<String>,
    pub size_bytes: Option<u64>,
}

impl SavedFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mime_type: None,
            size_bytes: None,
        }
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub mime_type: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub original_bytes: Option<u64>,
    pub compressed_bytes: Option<u64>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CompressedImage {
    pub base64: String,
    pub metadata: ImageMetadata,
}

/// What a batch recorded about a reference image it used.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReferenceDescriptor {
    pub path: PathBuf,
    pub metadata: ImageMetadata,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReferenceImage {
    pub path: PathBuf,
    pub base64: String,
    pub metadata: ImageMetadata,
}

/// Provider agnostic description of one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// The provider side model name.
    pub model: String,
    pub prompt: String,
    pub image_count: u32,
    pub references: Vec<ReferenceImage>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub parameters: serde_json::Value,
}

/// An error reported by an [`ImageApi`].
///
/// Carries everything the dispatcher needs to classify the failure, there is no need to inspect
/// the concrete error type of the client.
#[derive(Debug, Clone, Error, Eq, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
pub struct ApiError {
    pub message: String,
    pub status: Option<u16>,
    pub details: Option<String>,
    pub retryable: bool,
    pub hint: Option<String>,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            details: None,
            retryable: false,
            hint: None,
        }
    }

    pub fn with_status(self, status: u16) -> Self {
        Self {
            status: Some(status),
            ..self
        }
    }

    pub fn with_details(self, details: impl Into<String>) -> Self {
        Self {
            details: Some(details.into()),
            ..self
        }
    }

    pub fn with_hint(self, hint: impl Into<String>) -> Self {
        Self {
            hint: Some(hint.into()),
            ..self
        }
    }

    pub fn retryable(self) -> Self {
        Self {
            retryable: true,
            ..self
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// A human readable suggestion, falling back to one derived from the status.
    pub fn hint(&self) -> Option<String> {
        self.hint.clone().or_else(|| {
            let hint = match self.status? {
                400 => "Check the prompt and request parameters",
                401 | 403 => "Check the API credentials",
                413 => "Reduce the number or size of reference images",
                429 => "The provider is rate limiting requests, lower the call rate",
                500..=599 => "The provider is having problems, try again later",
                _ => return None,
            };
            Some(hint.to_owned())
        })
    }
}

/// Failure of a local collaborator (prompt processing, reference resolution, compression).
#[derive(Debug, Clone, Error, Eq, PartialEq)]
#[error("{message}")]
pub struct CollaboratorError {
    pub message: String,
    pub details: Option<String>,
}

impl CollaboratorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(self, details: impl Into<String>) -> Self {
        Self {
            details: Some(details.into()),
            ..self
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageApi: Send + Sync {
    /// Runs the generation and writes the produced images to `output_dir`.
    async fn generate_and_save(
        &self,
        request: GenerationRequest,
        output_dir: &Path,
        filename_prefix: &str,
    ) -> Result<Vec<SavedFile>, ApiError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageCompressor: Send + Sync {
    async fn compress_image(
        &self,
        path: &Path,
        byte_budget: usize,
    ) -> Result<CompressedImage, CollaboratorError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReferenceResolver: Send + Sync {
    async fn resolve_pattern(
        &self,
        pattern: &str,
        base_dir: &Path,
    ) -> Result<Vec<PathBuf>, CollaboratorError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PromptProcessor: Send + Sync {
    /// Expands the prompt of a job for the batch with the given index.
    async fn process(
        &self,
        prompt: &PromptConfig,
        batch_index: u32,
    ) -> Result<String, CollaboratorError>;
}

/// The set of collaborators a [`crate::Dispatcher`] is constructed with.
#[derive(Clone)]
pub struct Collaborators {
    pub api: Arc<dyn ImageApi>,
    pub compressor: Arc<dyn ImageCompressor>,
    pub resolver: Arc<dyn ReferenceResolver>,
    pub prompts: Arc<dyn PromptProcessor>,
}

impl Collaborators {
    pub fn new(
        api: Arc<dyn ImageApi>,
        compressor: Arc<dyn ImageCompressor>,
        resolver: Arc<dyn ReferenceResolver>,
        prompts: Arc<dyn PromptProcessor>,
    ) -> Self {
        Self {
            api,
            compressor,
            resolver,
            prompts,
        }
    }
}

impl Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("api", &"ImageApi")
            .field("compressor", &"ImageCompressor")
            .field("resolver", &"ReferenceResolver")
            .field("prompts", &"PromptProcessor")
            .finish()
    }
}
