use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Execution parameters of a generation model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// The identifier sent to the provider, which may differ from the registry key.
    pub name: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    /// Provider specific parameters forwarded untouched.
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl ModelConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_provider(self, provider: impl Into<String>) -> Self {
        Self {
            provider: Some(provider.into()),
            ..self
        }
    }

    pub fn with_size(self, width: u32, height: u32) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            ..self
        }
    }

    pub fn with_parameters(self, parameters: serde_json::Value) -> Self {
        Self { parameters, ..self }
    }
}

/// Model identifiers mapped to their [`ModelConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelRegistry(HashMap<String, ModelConfig>);

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, id: impl Into<String>, config: ModelConfig) -> Self {
        self.insert(id, config);
        self
    }

    pub fn insert(&mut self, id: impl Into<String>, config: ModelConfig) -> Option<ModelConfig> {
        self.0.insert(id.into(), config)
    }

    pub fn get(&self, id: &str) -> Option<&ModelConfig> {
        self.0.get(id)
    }

    /// Adds every model of `other`, replacing models with the same identifier.
    pub fn merge(&mut self, other: ModelRegistry) {
        self.0.extend(other.0);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, ModelConfig)> for ModelRegistry {
    fn from_iter<T: IntoIterator<Item = (K, ModelConfig)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(id, config)| (id.into(), config)).collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn merge_replaces_existing_models() {
        let mut registry = ModelRegistry::new()
            .with_model("fast", ModelConfig::new("fast-v1"))
            .with_model("slow", ModelConfig::new("slow-v1"));

        registry.merge([("fast", ModelConfig::new("fast-v2"))].into_iter().collect());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("fast").map(|model| model.name.as_str()), Some("fast-v2"));
        assert_eq!(registry.get("slow").map(|model| model.name.as_str()), Some("slow-v1"));
    }

    #[test]
    fn deserializes_a_keyed_registry() {
        let registry: ModelRegistry = serde_json::from_value(serde_json::json!({
            "flash": { "name": "flash-image-001", "width": 1024, "height": 1024 },
        }))
        .unwrap();

        assert_eq!(
            registry.get("flash"),
            Some(&ModelConfig::new("flash-image-001").with_size(1024, 1024))
        );
        assert!(registry.get("missing").is_none());
    }
}
