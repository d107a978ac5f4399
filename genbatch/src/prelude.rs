//! The purpose of this module is to alleviate the need to import many of the `[genbatch]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use genbatch::prelude::*;
//! ```
pub use crate::backoff::BackoffStrategy;
pub use crate::backoff::Jitter;
pub use crate::backoff::Strategy;
pub use crate::collaborators::{
    ApiError, CollaboratorError, Collaborators, ImageApi, ImageCompressor, PromptProcessor,
    ReferenceResolver,
};
pub use crate::concurrency::{ConcurrencyConfig, ConcurrencyLimiter};
pub use crate::dispatcher::{DispatcherOptions, ExecutionError};
pub use crate::events::DispatcherEvent;
pub use crate::job::{ExecutionMode, Job, JobEntry, JobId, JobState};
pub use crate::model::{ModelConfig, ModelRegistry};
pub use crate::policy::{FailurePolicy, RetryPolicy};
pub use crate::rate_limit::{RateLimitConfig, RateLimiter};
pub use crate::{Dispatcher, DispatcherError};
