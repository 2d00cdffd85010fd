//! Text-generation providers.
//!
//! Each model family is served by one `TextGenerator`, looked up by name in
//! a `ProviderRegistry`. Adding a backend means implementing the trait and
//! registering it; nothing in the executor matches on model names.
//!
//! Production code builds the registry from config (`http` backends).
//! Tests register `FakeGenerator` instances with scripted replies.

pub mod fake;
pub mod http;

use crate::config::{BackendKind, ProviderConfig};
use async_trait::async_trait;
use medgate_shared::audit::TokenUsage;
use medgate_shared::packet::Constraints;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub use fake::{FakeGenerator, FakeReply};
pub use http::{OllamaGenerator, OpenAiCompatibleGenerator};

/// Provider errors. All of them are transient from the executor's point of
/// view: the attempt fails and the cascade moves on.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Provider returned empty response")]
    Empty,

    #[error("Request timeout after {0} ms")]
    Timeout(u64),

    #[error("No provider registered for model '{0}'")]
    NotRegistered(String),

    #[error("API key variable '{0}' is not set")]
    MissingApiKey(String),
}

/// One successful generation
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub usage: TokenUsage,
}

/// Opaque text-generation capability for one model family
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Backend label for logs
    fn describe(&self) -> String;

    async fn generate(&self, prompt: &str, constraints: &Constraints) -> Result<Generation, ProviderError>;
}

/// Rough token estimate when a backend reports no usage
pub(crate) fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() as u32).div_ceil(4)
}

/// Model family -> generator lookup table
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    generators: HashMap<String, Arc<dyn TextGenerator>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, model: &str, generator: Arc<dyn TextGenerator>) {
        self.generators.insert(model.to_string(), generator);
    }

    /// Builder-style `register`
    pub fn with(mut self, model: &str, generator: Arc<dyn TextGenerator>) -> Self {
        self.register(model, generator);
        self
    }

    pub fn get(&self, model: &str) -> Result<Arc<dyn TextGenerator>, ProviderError> {
        self.generators
            .get(model)
            .cloned()
            .ok_or_else(|| ProviderError::NotRegistered(model.to_string()))
    }

    pub fn contains(&self, model: &str) -> bool {
        self.generators.contains_key(model)
    }

    pub fn models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.generators.keys().cloned().collect();
        models.sort();
        models
    }

    /// Build HTTP backends for every configured model family
    pub fn from_config(providers: &BTreeMap<String, ProviderConfig>) -> Result<Self, ProviderError> {
        let mut registry = Self::new();
        for (model, cfg) in providers {
            let generator: Arc<dyn TextGenerator> = match cfg.kind {
                BackendKind::Ollama => Arc::new(OllamaGenerator::new(cfg)?),
                BackendKind::OpenaiCompatible => Arc::new(OpenAiCompatibleGenerator::new(cfg)?),
            };
            info!("Provider for {}: {}", model, generator.describe());
            registry.register(model, generator);
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_is_not_registered() {
        let registry = ProviderRegistry::new();
        assert!(matches!(
            registry.get("Local-Llama-3"),
            Err(ProviderError::NotRegistered(m)) if m == "Local-Llama-3"
        ));
    }

    #[test]
    fn test_register_and_list() {
        let fake = Arc::new(FakeGenerator::always("ok"));
        let registry = ProviderRegistry::new()
            .with("b-model", fake.clone())
            .with("a-model", fake);
        assert_eq!(registry.models(), vec!["a-model", "b-model"]);
        assert!(registry.contains("a-model"));
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
