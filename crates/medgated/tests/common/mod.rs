//! Shared fixtures for medgated integration tests

#![allow(dead_code)]

use medgate_shared::policy::{MODEL_CLAUDE, MODEL_GEMINI, MODEL_GPT4O, MODEL_LOCAL};
use medgated::audit_store::MemoryAuditStore;
use medgated::config::Config;
use async_trait::async_trait;
use medgate_shared::packet::Constraints;
use medgated::provider::{FakeGenerator, Generation, ProviderError, ProviderRegistry, TextGenerator};
use medgated::Mediator;
use std::sync::Arc;
use tempfile::TempDir;

pub const ALL_MODELS: [&str; 4] = [MODEL_GPT4O, MODEL_CLAUDE, MODEL_GEMINI, MODEL_LOCAL];

pub struct Harness {
    pub mediator: Arc<Mediator>,
    pub store: Arc<MemoryAuditStore>,
    pub dir: TempDir,
}

impl Harness {
    pub fn journal_path(&self) -> std::path::PathBuf {
        self.dir.path().join("nearmiss.jsonl")
    }
}

pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.audit.journal_path = dir.path().join("nearmiss.jsonl");
    config.audit.retry_backoff_ms = 1;
    config
}

pub fn harness_with(registry: ProviderRegistry, config: impl FnOnce(&mut Config)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(&dir);
    config(&mut cfg);
    let store = Arc::new(MemoryAuditStore::new());
    let mediator = Arc::new(Mediator::new(&cfg, registry, store.clone()));
    Harness { mediator, store, dir }
}

pub fn harness(registry: ProviderRegistry) -> Harness {
    harness_with(registry, |_| {})
}

/// Same fake behind every model family
pub fn shared_registry(fake: Arc<FakeGenerator>) -> ProviderRegistry {
    ALL_MODELS
        .iter()
        .fold(ProviderRegistry::new(), |reg, model| reg.with(model, fake.clone()))
}

/// Generator that panics mid-call
pub struct PanickingGenerator;

#[async_trait]
impl TextGenerator for PanickingGenerator {
    fn describe(&self) -> String {
        "panicking".to_string()
    }

    async fn generate(&self, _prompt: &str, _constraints: &Constraints) -> Result<Generation, ProviderError> {
        panic!("generator bug");
    }
}

/// Every model family panics
pub fn panicking_registry() -> ProviderRegistry {
    ALL_MODELS
        .iter()
        .fold(ProviderRegistry::new(), |reg, model| reg.with(model, Arc::new(PanickingGenerator)))
}

/// Standalone success record, for store-level tests
pub fn record(user: &str, model: &str, ts: chrono::DateTime<chrono::Utc>) -> medgate_shared::ModelCallAudit {
    use medgate_shared::audit::{AuditOutcome, ModelCallAudit};
    use medgate_shared::packet::{
        content_hash, AuditMeta, Constraints, ContextPacket, Inputs, OutputKind, RoutingHints,
        SafetyMode, TaskSpec, UserContext, PROTOCOL_VERSION,
    };

    let packet = ContextPacket {
        version: PROTOCOL_VERSION.to_string(),
        user: UserContext {
            id: user.to_string(),
            role: "clinician".to_string(),
            department: "icu".to_string(),
            session_id: String::new(),
            clearance_level: None,
        },
        task: TaskSpec {
            intent: "Summarize".to_string(),
            model_family: model.to_string(),
            output_kind: OutputKind::Summary,
        },
        inputs: Inputs {
            prompt: "notes".to_string(),
            data_refs: vec![],
            context_window: vec![],
        },
        constraints: Constraints {
            max_tokens: 256,
            redact_phi: true,
            safety_mode: SafetyMode::High,
            timeout_ms: None,
        },
        routing: RoutingHints {
            target_agent: "test-agent".to_string(),
            use_fallback: true,
            priority: None,
        },
        audit: AuditMeta {
            request_time: ts,
            source_ip: None,
            user_agent: None,
            content_hash: content_hash(&[user, "notes"]),
            compliance_flags: vec![],
        },
    };
    let mut rec = ModelCallAudit::for_packet(&packet, AuditOutcome::Success, model);
    rec.timestamp = ts;
    rec
}
