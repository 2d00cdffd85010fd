//! Model Router: pick a target model and its fallback cascade for a packet.
//!
//! Routing is a pure function of the packet and the static policy. It never
//! fails: unknown roles and empty access lists resolve to the restricted
//! model with a reason string explaining why.
//!
//! Decision order:
//! 1. safety = maximum and redact-PHI set -> restricted model, local-only cascade
//! 2. role missing from the matrix -> restricted model
//! 3. requested family permitted -> use it
//! 4. otherwise -> role's highest-priority permitted family (downgrade)

use crate::packet::{ContextPacket, SafetyMode};
use crate::policy::ModelPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Outcome of routing one packet. Computed fresh per call, never stored
/// except as fields of the audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub selected_model: String,
    pub provider: String,
    pub reasoning: String,
    /// Alternates after `selected_model`, in order, never containing it
    pub fallback_chain: Vec<String>,
    /// Selected model may receive this packet's content
    pub security_cleared: bool,
    pub estimated_tokens: u32,
    pub estimated_cost: f64,
}

impl RoutingDecision {
    /// Selected model followed by the cascade, duplicates removed, order kept
    pub fn candidates(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        std::iter::once(&self.selected_model)
            .chain(self.fallback_chain.iter())
            .filter(|m| seen.insert(m.as_str()))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ModelRouter {
    policy: Arc<ModelPolicy>,
}

impl ModelRouter {
    pub fn new(policy: Arc<ModelPolicy>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ModelPolicy {
        &self.policy
    }

    pub fn route(&self, packet: &ContextPacket) -> RoutingDecision {
        let policy = &*self.policy;
        let requested = packet.task.model_family.as_str();
        let restricted = policy.restricted_model.clone();
        let forced = packet.constraints.safety_mode == SafetyMode::Maximum
            && packet.constraints.redact_phi;

        let permitted = policy.permitted_models(&packet.user.role);

        let (selected, reasoning) = if forced {
            (
                restricted.clone(),
                format!(
                    "maximum safety with PHI redaction: forced to restricted local model '{}' (requested '{}')",
                    restricted, requested
                ),
            )
        } else {
            match permitted {
                None => (
                    restricted.clone(),
                    format!(
                        "unknown role '{}': defaulting to most restrictive model '{}'",
                        packet.user.role, restricted
                    ),
                ),
                Some([]) => (
                    restricted.clone(),
                    format!(
                        "role '{}' has no permitted models: defaulting to '{}'",
                        packet.user.role, restricted
                    ),
                ),
                Some(models) if models.iter().any(|m| m == requested) => (
                    requested.to_string(),
                    format!(
                        "role '{}' has access to requested model '{}'",
                        packet.user.role, requested
                    ),
                ),
                Some(models) => (
                    models[0].clone(),
                    format!(
                        "role '{}' lacks access to '{}': auto-downgraded to '{}'",
                        packet.user.role, requested, models[0]
                    ),
                ),
            }
        };

        let fallback_chain = if packet.routing.use_fallback {
            self.build_cascade(&selected, permitted, forced)
        } else {
            Vec::new()
        };

        let profile = policy.profile(&selected);
        let provider = profile
            .map(|p| p.provider.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let local_only = profile.map(|p| p.local_only).unwrap_or(false);
        let security_cleared = local_only || packet.constraints.redact_phi;

        let prompt_tokens = (packet.inputs.prompt.len() / 4) as u32;
        let completion_tokens = profile
            .map(|p| p.typical_completion_tokens.min(packet.constraints.max_tokens))
            .unwrap_or(packet.constraints.max_tokens);
        let estimated_tokens = prompt_tokens + completion_tokens;
        let estimated_cost = profile
            .map(|p| estimated_tokens as f64 / 1000.0 * p.cost_per_1k_tokens)
            .unwrap_or(0.0);

        RoutingDecision {
            selected_model: selected,
            provider,
            reasoning,
            fallback_chain,
            security_cleared,
            estimated_tokens,
            estimated_cost,
        }
    }

    /// Alternates for `selected`, restricted to what the role may use. When
    /// the restricted model was forced, only local-only models qualify.
    fn build_cascade(&self, selected: &str, permitted: Option<&[String]>, forced: bool) -> Vec<String> {
        let policy = &*self.policy;
        let mut seen: HashSet<&str> = HashSet::new();
        seen.insert(selected);

        policy
            .cascade_for(selected)
            .iter()
            .filter(|m| {
                if forced {
                    policy.is_local_only(m)
                } else {
                    match permitted {
                        Some(list) if !list.is_empty() => list.iter().any(|p| p == *m),
                        _ => policy.is_local_only(m),
                    }
                }
            })
            .filter(|m| seen.insert(m.as_str()))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::tests::sample_packet;
    use crate::policy::{MODEL_CLAUDE, MODEL_GEMINI, MODEL_GPT4O, MODEL_LOCAL};

    fn router() -> ModelRouter {
        ModelRouter::new(Arc::new(ModelPolicy::default()))
    }

    #[test]
    fn test_permitted_request_is_honoured() {
        let d = router().route(&sample_packet());
        assert_eq!(d.selected_model, MODEL_GPT4O);
        assert_eq!(d.provider, "openai");
        assert_eq!(d.fallback_chain, vec![MODEL_CLAUDE, MODEL_GEMINI, MODEL_LOCAL]);
    }

    #[test]
    fn test_nurse_cascade_filtered_to_permitted() {
        let mut p = sample_packet();
        p.user.role = "nurse".to_string();
        p.task.model_family = MODEL_GEMINI.to_string();
        let d = router().route(&p);
        assert_eq!(d.selected_model, MODEL_GEMINI);
        assert_eq!(d.fallback_chain, vec![MODEL_LOCAL]);
    }

    #[test]
    fn test_no_fallback_flag_empties_cascade() {
        let mut p = sample_packet();
        p.routing.use_fallback = false;
        assert!(router().route(&p).fallback_chain.is_empty());
    }

    #[test]
    fn test_candidates_deduplicated() {
        let d = RoutingDecision {
            selected_model: "a".into(),
            provider: "x".into(),
            reasoning: String::new(),
            fallback_chain: vec!["b".into(), "a".into(), "b".into(), "c".into()],
            security_cleared: true,
            estimated_tokens: 0,
            estimated_cost: 0.0,
        };
        assert_eq!(d.candidates(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_estimates_are_nonnegative() {
        let d = router().route(&sample_packet());
        assert!(d.estimated_tokens > 0);
        assert!(d.estimated_cost >= 0.0);
    }
}
