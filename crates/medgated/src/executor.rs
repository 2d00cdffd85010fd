//! Fallback Executor
//!
//! Walks the candidate list (selected model, then its cascade) until one
//! provider returns usable text. Each attempt is bounded by a timeout. A
//! model is never attempted twice within one call.

use crate::provider::{Generation, ProviderError, ProviderRegistry};
use medgate_shared::audit::TokenUsage;
use medgate_shared::error::MediatorError;
use medgate_shared::packet::ContextPacket;
use medgate_shared::routing::RoutingDecision;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// One provider attempt, kept for logging and tests
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    pub model: String,
    pub elapsed_ms: u64,
    /// `None` when this attempt produced the answer
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub model_used: String,
    pub text: String,
    pub usage: TokenUsage,
    /// True iff a candidate after the first produced the answer
    pub fallback_triggered: bool,
    pub attempts: Vec<Attempt>,
}

pub struct FallbackExecutor {
    registry: Arc<ProviderRegistry>,
    default_timeout: Duration,
}

impl FallbackExecutor {
    pub fn new(registry: Arc<ProviderRegistry>, default_timeout: Duration) -> Self {
        Self {
            registry,
            default_timeout,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    fn attempt_timeout(&self, packet: &ContextPacket) -> Duration {
        packet
            .constraints
            .timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout)
    }

    async fn attempt(&self, model: &str, prompt: &str, packet: &ContextPacket, timeout: Duration) -> Result<Generation, ProviderError> {
        let generator = self.registry.get(model)?;
        match tokio::time::timeout(timeout, generator.generate(prompt, &packet.constraints)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(timeout.as_millis() as u64)),
        }
    }

    /// Run the cascade. Fails only with `CascadeExhausted`.
    pub async fn execute(&self, packet: &ContextPacket, decision: &RoutingDecision) -> Result<ExecutionOutcome, MediatorError> {
        let prompt = packet.render_prompt();
        let timeout = self.attempt_timeout(packet);
        let mut tried: HashSet<String> = HashSet::new();
        let mut attempts: Vec<Attempt> = Vec::new();
        let mut last_error = String::from("no candidate models");

        for model in decision.candidates() {
            if !tried.insert(model.clone()) {
                continue;
            }
            let started = Instant::now();
            let result = self.attempt(&model, &prompt, packet, timeout).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(generation) => {
                    let fallback_triggered = !attempts.is_empty();
                    if fallback_triggered {
                        info!(
                            "Served by fallback model {} after {} failed attempt(s)",
                            model,
                            attempts.len()
                        );
                    }
                    attempts.push(Attempt {
                        model: model.clone(),
                        elapsed_ms,
                        error: None,
                    });
                    return Ok(ExecutionOutcome {
                        model_used: model,
                        text: generation.text,
                        usage: generation.usage,
                        fallback_triggered,
                        attempts,
                    });
                }
                Err(e) => {
                    warn!("Attempt on {} failed after {} ms: {}", model, elapsed_ms, e);
                    last_error = e.to_string();
                    attempts.push(Attempt {
                        model,
                        elapsed_ms,
                        error: Some(last_error.clone()),
                    });
                }
            }
        }

        Err(MediatorError::CascadeExhausted {
            attempted: attempts.into_iter().map(|a| a.model).collect(),
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{FakeGenerator, FakeReply};
    use medgate_shared::packet::{
        AuditMeta, Constraints, Inputs, OutputKind, RoutingHints, SafetyMode, TaskSpec, UserContext,
        PROTOCOL_VERSION,
    };

    fn packet(timeout_ms: Option<u64>) -> ContextPacket {
        ContextPacket {
            version: PROTOCOL_VERSION.to_string(),
            user: UserContext {
                id: "u".into(),
                role: "clinician".into(),
                department: "icu".into(),
                session_id: String::new(),
                clearance_level: None,
            },
            task: TaskSpec {
                intent: "Summarize".into(),
                model_family: "a".into(),
                output_kind: OutputKind::Summary,
            },
            inputs: Inputs {
                prompt: "notes".into(),
                data_refs: vec![],
                context_window: vec![],
            },
            constraints: Constraints {
                max_tokens: 100,
                redact_phi: true,
                safety_mode: SafetyMode::High,
                timeout_ms,
            },
            routing: RoutingHints {
                target_agent: "x".into(),
                use_fallback: true,
                priority: None,
            },
            audit: AuditMeta {
                request_time: chrono::Utc::now(),
                source_ip: None,
                user_agent: None,
                content_hash: "h".into(),
                compliance_flags: vec![],
            },
        }
    }

    fn decision(selected: &str, chain: &[&str]) -> RoutingDecision {
        RoutingDecision {
            selected_model: selected.into(),
            provider: "test".into(),
            reasoning: "test".into(),
            fallback_chain: chain.iter().map(|s| s.to_string()).collect(),
            security_cleared: true,
            estimated_tokens: 0,
            estimated_cost: 0.0,
        }
    }

    #[tokio::test]
    async fn test_first_candidate_success_is_not_fallback() {
        let a = Arc::new(FakeGenerator::always("from a"));
        let registry = ProviderRegistry::new().with("a", a.clone());
        let exec = FallbackExecutor::new(Arc::new(registry), Duration::from_secs(1));

        let out = exec.execute(&packet(None), &decision("a", &["b"])).await.unwrap();
        assert_eq!(out.model_used, "a");
        assert!(!out.fallback_triggered);
        assert_eq!(out.attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_advances_and_never_repeats() {
        let a = Arc::new(FakeGenerator::failing("503"));
        let b = Arc::new(FakeGenerator::new(vec![FakeReply::Empty], FakeReply::text("unused")));
        let c = Arc::new(FakeGenerator::always("from c"));
        let registry = ProviderRegistry::new()
            .with("a", a.clone())
            .with("b", b.clone())
            .with("c", c.clone());
        let exec = FallbackExecutor::new(Arc::new(registry), Duration::from_secs(1));

        let out = exec
            .execute(&packet(None), &decision("a", &["b", "a", "b", "c"]))
            .await
            .unwrap();
        assert_eq!(out.model_used, "c");
        assert!(out.fallback_triggered);
        assert_eq!((a.call_count(), b.call_count(), c.call_count()), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_timeout_and_missing_provider_exhaust() {
        let slow = Arc::new(FakeGenerator::always("late").with_delay(Duration::from_millis(200)));
        let registry = ProviderRegistry::new().with("slow", slow.clone());
        let exec = FallbackExecutor::new(Arc::new(registry), Duration::from_secs(5));

        let err = exec
            .execute(&packet(Some(20)), &decision("slow", &["unregistered"]))
            .await
            .unwrap_err();
        match err {
            MediatorError::CascadeExhausted { attempted, last_error } => {
                assert_eq!(attempted, vec!["slow", "unregistered"]);
                assert!(last_error.contains("No provider registered"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(slow.call_count(), 1);
        assert_eq!(slow.max_in_flight(), 1);
    }
}
