//! Static routing policy: role-access matrix, fallback cascades, model profiles.
//!
//! Policy is data, not control flow. The built-in tables below are the
//! defaults. A config file overlays them entry by entry: a role, cascade,
//! model or tier named in the file replaces the built-in entry of that name
//! and everything else is kept. After startup the policy is immutable and
//! shared behind an `Arc`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MODEL_GPT4O: &str = "OpenAI-GPT-4o";
pub const MODEL_CLAUDE: &str = "Anthropic-Claude-3.5";
pub const MODEL_GEMINI: &str = "Google-Gemini-Pro";
pub const MODEL_LOCAL: &str = "Local-Llama-3";

/// Per-model observability figures. Cost and token numbers are estimates
/// used for logging only, never for billing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub provider: String,
    /// Runs inside the trusted boundary; content never leaves the site
    #[serde(default)]
    pub local_only: bool,
    #[serde(default)]
    pub cost_per_1k_tokens: f64,
    #[serde(default = "default_typical_completion")]
    pub typical_completion_tokens: u32,
}

fn default_typical_completion() -> u32 {
    512
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "PolicyOverlay")]
pub struct ModelPolicy {
    /// role -> permitted model families, highest priority first
    pub role_access: BTreeMap<String, Vec<String>>,
    /// model -> alternates to try when it fails, in order
    pub fallback_cascade: BTreeMap<String, Vec<String>>,
    pub models: BTreeMap<String, ModelProfile>,
    /// Most restrictive model: unknown roles and maximum-safety PHI work land here
    pub restricted_model: String,
    /// Abstract preference tier ("smart", "fast", "local", "precise") -> model family
    pub tier_families: BTreeMap<String, String>,
}

/// Deserialized form of a policy table: only the entries the file names
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PolicyOverlay {
    role_access: BTreeMap<String, Vec<String>>,
    fallback_cascade: BTreeMap<String, Vec<String>>,
    models: BTreeMap<String, ModelProfile>,
    restricted_model: Option<String>,
    tier_families: BTreeMap<String, String>,
}

impl From<PolicyOverlay> for ModelPolicy {
    fn from(overlay: PolicyOverlay) -> Self {
        let mut policy = ModelPolicy::default();
        policy.role_access.extend(
            overlay
                .role_access
                .into_iter()
                .map(|(role, models)| (role.trim().to_lowercase(), models)),
        );
        policy.fallback_cascade.extend(overlay.fallback_cascade);
        policy.models.extend(overlay.models);
        policy.tier_families.extend(overlay.tier_families);
        if let Some(restricted) = overlay.restricted_model {
            policy.restricted_model = restricted;
        }
        policy
    }
}

fn list(models: &[&str]) -> Vec<String> {
    models.iter().map(|m| m.to_string()).collect()
}

impl Default for ModelPolicy {
    fn default() -> Self {
        let mut role_access = BTreeMap::new();
        role_access.insert("clinician".to_string(), list(&[MODEL_GPT4O, MODEL_CLAUDE, MODEL_GEMINI, MODEL_LOCAL]));
        role_access.insert("oncologist".to_string(), list(&[MODEL_CLAUDE, MODEL_GPT4O, MODEL_GEMINI, MODEL_LOCAL]));
        role_access.insert("nurse".to_string(), list(&[MODEL_GEMINI, MODEL_LOCAL]));
        role_access.insert("technician".to_string(), list(&[MODEL_LOCAL]));
        role_access.insert("researcher".to_string(), list(&[MODEL_CLAUDE, MODEL_GEMINI, MODEL_LOCAL]));
        role_access.insert("admin".to_string(), list(&[MODEL_GPT4O, MODEL_CLAUDE, MODEL_GEMINI, MODEL_LOCAL]));

        let mut fallback_cascade = BTreeMap::new();
        fallback_cascade.insert(MODEL_GPT4O.to_string(), list(&[MODEL_CLAUDE, MODEL_GEMINI, MODEL_LOCAL]));
        fallback_cascade.insert(MODEL_CLAUDE.to_string(), list(&[MODEL_GPT4O, MODEL_GEMINI, MODEL_LOCAL]));
        fallback_cascade.insert(MODEL_GEMINI.to_string(), list(&[MODEL_GPT4O, MODEL_LOCAL]));
        fallback_cascade.insert(MODEL_LOCAL.to_string(), Vec::new());

        let mut models = BTreeMap::new();
        models.insert(
            MODEL_GPT4O.to_string(),
            ModelProfile {
                provider: "openai".to_string(),
                local_only: false,
                cost_per_1k_tokens: 0.01,
                typical_completion_tokens: 800,
            },
        );
        models.insert(
            MODEL_CLAUDE.to_string(),
            ModelProfile {
                provider: "anthropic".to_string(),
                local_only: false,
                cost_per_1k_tokens: 0.009,
                typical_completion_tokens: 900,
            },
        );
        models.insert(
            MODEL_GEMINI.to_string(),
            ModelProfile {
                provider: "google".to_string(),
                local_only: false,
                cost_per_1k_tokens: 0.005,
                typical_completion_tokens: 700,
            },
        );
        models.insert(
            MODEL_LOCAL.to_string(),
            ModelProfile {
                provider: "ollama".to_string(),
                local_only: true,
                cost_per_1k_tokens: 0.0,
                typical_completion_tokens: 500,
            },
        );

        let mut tier_families = BTreeMap::new();
        tier_families.insert("smart".to_string(), MODEL_CLAUDE.to_string());
        tier_families.insert("fast".to_string(), MODEL_GEMINI.to_string());
        tier_families.insert("local".to_string(), MODEL_LOCAL.to_string());
        tier_families.insert("precise".to_string(), MODEL_GPT4O.to_string());

        Self {
            role_access,
            fallback_cascade,
            models,
            restricted_model: MODEL_LOCAL.to_string(),
            tier_families,
        }
    }
}

impl ModelPolicy {
    pub fn permitted_models(&self, role: &str) -> Option<&[String]> {
        self.role_access
            .get(&role.trim().to_lowercase())
            .map(|v| v.as_slice())
    }

    pub fn cascade_for(&self, model: &str) -> &[String] {
        self.fallback_cascade
            .get(model)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn profile(&self, model: &str) -> Option<&ModelProfile> {
        self.models.get(model)
    }

    pub fn is_local_only(&self, model: &str) -> bool {
        self.profile(model).map(|p| p.local_only).unwrap_or(false)
    }

    pub fn family_for_tier(&self, tier: &str) -> Option<&str> {
        self.tier_families.get(tier).map(|s| s.as_str())
    }

    /// Check that every table references known models and that the
    /// restricted model really stays inside the trust boundary.
    pub fn validate(&self) -> Result<(), String> {
        let mut problems = Vec::new();

        match self.profile(&self.restricted_model) {
            None => problems.push(format!(
                "restricted model '{}' has no profile",
                self.restricted_model
            )),
            Some(p) if !p.local_only => problems.push(format!(
                "restricted model '{}' is not local_only",
                self.restricted_model
            )),
            Some(_) => {}
        }

        for (role, models) in &self.role_access {
            for m in models {
                if !self.models.contains_key(m) {
                    problems.push(format!("role '{}' references unknown model '{}'", role, m));
                }
            }
        }
        for (model, alternates) in &self.fallback_cascade {
            for m in std::iter::once(model).chain(alternates.iter()) {
                if !self.models.contains_key(m) {
                    problems.push(format!("cascade for '{}' references unknown model '{}'", model, m));
                }
            }
        }
        for (tier, m) in &self.tier_families {
            if !self.models.contains_key(m) {
                problems.push(format!("tier '{}' references unknown model '{}'", tier, m));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        }
    }
}
