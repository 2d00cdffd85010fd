//! HTTP backends: Ollama native and OpenAI-compatible chat completions.

use super::{estimate_tokens, Generation, ProviderError, TextGenerator};
use crate::config::ProviderConfig;
use async_trait::async_trait;
use medgate_shared::audit::TokenUsage;
use medgate_shared::packet::Constraints;
use serde_json::Value;
use tracing::debug;

const SYSTEM_PROMPT: &str = "You are a clinical decision-support assistant. \
Answer only from the information provided, state uncertainty plainly, \
and never invent patient identifiers.";

fn build_client() -> Result<reqwest::Client, ProviderError> {
    // Per-attempt deadlines come from the executor
    reqwest::Client::builder()
        .build()
        .map_err(|e| ProviderError::Http(format!("Failed to create HTTP client: {}", e)))
}

fn map_send_error(e: reqwest::Error) -> ProviderError {
    ProviderError::Http(format!("Request failed: {}", e))
}

async fn check_status(response: reqwest::Response) -> Result<Value, ProviderError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::Status {
            status: status.as_u16(),
            body: body.chars().take(300).collect(),
        });
    }
    response
        .json::<Value>()
        .await
        .map_err(|e| ProviderError::Malformed(format!("Failed to parse response: {}", e)))
}

fn non_empty(text: &str) -> Result<String, ProviderError> {
    if text.trim().is_empty() {
        Err(ProviderError::Empty)
    } else {
        Ok(text.to_string())
    }
}

// ============================================================================
// Ollama
// ============================================================================

pub struct OllamaGenerator {
    endpoint: String,
    model: String,
    temperature: Option<f32>,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(cfg: &ProviderConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            client: build_client()?,
        })
    }
}

#[async_trait]
impl TextGenerator for OllamaGenerator {
    fn describe(&self) -> String {
        format!("ollama {} at {}", self.model, self.endpoint)
    }

    async fn generate(&self, prompt: &str, constraints: &Constraints) -> Result<Generation, ProviderError> {
        let url = format!("{}/api/generate", self.endpoint);
        let mut options = serde_json::json!({ "num_predict": constraints.max_tokens });
        if let Some(t) = self.temperature {
            options["temperature"] = serde_json::json!(t);
        }
        let body = serde_json::json!({
            "model": self.model,
            "system": SYSTEM_PROMPT,
            "prompt": prompt,
            "stream": false,
            "options": options,
        });

        debug!("ollama request to {} ({} chars)", url, prompt.len());
        let response = self.client.post(&url).json(&body).send().await.map_err(map_send_error)?;
        let json = check_status(response).await?;

        let text = json
            .get("response")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProviderError::Malformed("missing 'response' field".to_string()))?;
        let text = non_empty(text)?;

        let prompt_tokens = json
            .get("prompt_eval_count")
            .and_then(|v| v.as_u64())
            .map(|n| n as u32)
            .unwrap_or_else(|| estimate_tokens(prompt));
        let completion_tokens = json
            .get("eval_count")
            .and_then(|v| v.as_u64())
            .map(|n| n as u32)
            .unwrap_or_else(|| estimate_tokens(&text));

        Ok(Generation {
            text,
            usage: TokenUsage::new(prompt_tokens, completion_tokens),
        })
    }
}

// ============================================================================
// OpenAI-compatible
// ============================================================================

pub struct OpenAiCompatibleGenerator {
    base_url: String,
    model: String,
    temperature: Option<f32>,
    api_key_env: Option<String>,
    client: reqwest::Client,
}

impl OpenAiCompatibleGenerator {
    pub fn new(cfg: &ProviderConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            base_url: cfg.endpoint.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            api_key_env: cfg.api_key_env.clone(),
            client: build_client()?,
        })
    }

    /// Read at call time so a key rotated in the environment is picked up
    fn api_key(&self) -> Result<Option<String>, ProviderError> {
        match &self.api_key_env {
            None => Ok(None),
            Some(var) => std::env::var(var)
                .map(Some)
                .map_err(|_| ProviderError::MissingApiKey(var.clone())),
        }
    }
}

#[async_trait]
impl TextGenerator for OpenAiCompatibleGenerator {
    fn describe(&self) -> String {
        format!("openai-compatible {} at {}", self.model, self.base_url)
    }

    async fn generate(&self, prompt: &str, constraints: &Constraints) -> Result<Generation, ProviderError> {
        let api_key = self.api_key()?;
        let url = format!("{}/chat/completions", self.base_url);

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
            "max_tokens": constraints.max_tokens,
        });
        if let Some(t) = self.temperature {
            body["temperature"] = serde_json::json!(t);
        }

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }

        debug!("chat completion request to {} ({} chars)", url, prompt.len());
        let response = request.send().await.map_err(map_send_error)?;
        let json = check_status(response).await?;

        let text = json
            .get("choices")
            .and_then(|v| v.get(0))
            .and_then(|v| v.get("message"))
            .and_then(|v| v.get("content"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProviderError::Malformed("missing choices[0].message.content".to_string()))?;
        let text = non_empty(text)?;

        let usage = json.get("usage");
        let prompt_tokens = usage
            .and_then(|u| u.get("prompt_tokens"))
            .and_then(|v| v.as_u64())
            .map(|n| n as u32)
            .unwrap_or_else(|| estimate_tokens(prompt));
        let completion_tokens = usage
            .and_then(|u| u.get("completion_tokens"))
            .and_then(|v| v.as_u64())
            .map(|n| n as u32)
            .unwrap_or_else(|| estimate_tokens(&text));

        Ok(Generation {
            text,
            usage: TokenUsage::new(prompt_tokens, completion_tokens),
        })
    }
}
