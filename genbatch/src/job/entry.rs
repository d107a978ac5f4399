use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How the number of batches of a job is determined.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run exactly `batch_count` batches.
    Fixed { batch_count: u32 },
    /// Run as many batches as needed to produce `target_images` images.
    Target { target_images: u32 },
}

/// The prompt of a job before expansion.
///
/// The dispatcher does not interpret it, it is handed to the
/// [`crate::collaborators::PromptProcessor`] once per batch.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PromptConfig {
    pub template: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl PromptConfig {
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

impl From<&str> for PromptConfig {
    fn from(value: &str) -> Self {
        Self {
            template: value.to_owned(),
            variables: Default::default(),
        }
    }
}

impl From<String> for PromptConfig {
    fn from(template: String) -> Self {
        Self {
            template,
            variables: Default::default(),
        }
    }
}

/// A user declared generation request, the input of [`crate::Dispatcher::create_job`].
///
/// # Example
///
/// ```
/// # use genbatch::prelude::*;
/// let entry = JobEntry::target("entry-1", "flash-image", 10)
///     .with_images_per_batch(4)
///     .with_prompt("a lighthouse at {time_of_day}")
///     .with_variable("time_of_day", "dusk")
///     .with_reference("refs/*.png")
///     .with_output_subdir("lighthouses");
///
/// assert_eq!(entry.mode, ExecutionMode::Target { target_images: 10 });
/// assert_eq!(entry.references, vec!["refs/*.png".to_owned()]);
/// ```
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobEntry {
    pub entry_id: String,
    pub prompt: PromptConfig,
    pub model: String,
    #[serde(flatten)]
    pub mode: ExecutionMode,
    pub images_per_batch: u32,
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default)]
    pub output_subdir: Option<String>,
    #[serde(default = "default_filename_prefix")]
    pub filename_prefix: String,
}

fn default_filename_prefix() -> String {
    "image".to_owned()
}

impl JobEntry {
    pub fn new(entry_id: impl Into<String>, model: impl Into<String>, mode: ExecutionMode) -> Self {
        Self {
            entry_id: entry_id.into(),
            prompt: Default::default(),
            model: model.into(),
            mode,
            images_per_batch: 1,
            references: Default::default(),
            output_subdir: None,
            filename_prefix: default_filename_prefix(),
        }
    }

    pub fn fixed(entry_id: impl Into<String>, model: impl Into<String>, batch_count: u32) -> Self {
        Self::new(entry_id, model, ExecutionMode::Fixed { batch_count })
    }

    pub fn target(
        entry_id: impl Into<String>,
        model: impl Into<String>,
        target_images: u32,
    ) -> Self {
        Self::new(entry_id, model, ExecutionMode::Target { target_images })
    }

    pub fn with_images_per_batch(self, images_per_batch: u32) -> Self {
        Self {
            images_per_batch,
            ..self
        }
    }

    pub fn with_prompt(self, prompt: impl Into<PromptConfig>) -> Self {
        Self {
            prompt: prompt.into(),
            ..self
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.prompt.variables.insert(name.into(), value.into());
        self
    }

    pub fn with_reference(mut self, pattern: impl Into<String>) -> Self {
        self.references.push(pattern.into());
        self
    }

    pub fn with_references(self, references: Vec<impl Into<String>>) -> Self {
        let references = references.into_iter().map(Into::into).collect();
        Self { references, ..self }
    }

    pub fn with_output_subdir(self, output_subdir: impl Into<String>) -> Self {
        Self {
            output_subdir: Some(output_subdir.into()),
            ..self
        }
    }

    pub fn with_filename_prefix(self, filename_prefix: impl Into<String>) -> Self {
        Self {
            filename_prefix: filename_prefix.into(),
            ..self
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deserializes_from_json() {
        let entry: JobEntry = serde_json::from_value(serde_json::json!({
            "entry_id": "entry-7",
            "prompt": { "template": "a cat" },
            "model": "flash-image",
            "mode": "fixed",
            "batch_count": 5,
            "images_per_batch": 4,
        }))
        .unwrap();

        assert_eq!(
            entry,
            JobEntry::fixed("entry-7", "flash-image", 5)
                .with_images_per_batch(4)
                .with_prompt("a cat")
        );
    }

    #[test]
    fn builder_sets_every_field() {
        let entry = JobEntry::fixed("entry", "model", 2)
            .with_references(vec!["a.png", "b/*.jpg"])
            .with_filename_prefix("cat")
            .with_output_subdir("cats");

        assert_eq!(entry.references.len(), 2);
        assert_eq!(entry.filename_prefix, "cat");
        assert_eq!(entry.output_subdir.as_deref(), Some("cats"));
        assert_eq!(entry.images_per_batch, 1);
    }
}
