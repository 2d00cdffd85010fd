//! Context Packet builder
//!
//! Turns a task-oriented request into a validated packet. Defaults lean
//! strict: redaction on, high safety, and maximum safety for lower-trust
//! roles and departments. Input PHI is redacted here, before anything is
//! logged or sent, so the packet doubles as a safe audit snapshot.

use chrono::Utc;
use medgate_shared::error::MediatorError;
use medgate_shared::packet::{
    content_hash, AuditMeta, Constraints, ContextPacket, Inputs, Role, RoutingHints, SafetyMode,
    TaskSpec, UserContext, FLAG_PHI_DETECTED, FLAG_PHI_OVERRIDE_DENIED, PROTOCOL_VERSION,
};
use medgate_shared::policy::ModelPolicy;
use medgate_shared::request::{Attachment, OutputFormat, OutputLength, Preferences, ProcessRequest};
use medgate_shared::screening::{contains_phi, redact_phi};
use std::sync::Arc;
use tracing::{debug, warn};

/// Departments whose requests get maximum safety by default
pub const STRICT_DEPARTMENTS: &[&str] = &["external", "public", "billing", "research"];

pub const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Attachment content is cut at this many characters in the prompt
const ATTACHMENT_CHAR_LIMIT: usize = 2000;

#[derive(Debug, Clone)]
pub struct BuiltPacket {
    pub packet: ContextPacket,
    /// Caller input as it may be kept in session memory
    pub input_excerpt: String,
    pub input_redactions: usize,
    /// Notes surfaced as safety warnings in the response
    pub notes: Vec<String>,
}

pub struct PacketBuilder {
    policy: Arc<ModelPolicy>,
}

fn is_lower_trust(role: Option<Role>, department: &str) -> bool {
    let dept = department.trim().to_lowercase();
    role.map(|r| r.is_lower_trust()).unwrap_or(true) || STRICT_DEPARTMENTS.contains(&dept.as_str())
}

fn describe_attachment(a: &Attachment) -> String {
    let kind = serde_json::to_value(a.kind)
        .ok()
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .unwrap_or_else(|| "attachment".to_string());
    let label = a.label.as_deref().map(|l| format!(" ({})", l)).unwrap_or_default();
    let body = match &a.content {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let body: String = if body.chars().count() > ATTACHMENT_CHAR_LIMIT {
        let cut: String = body.chars().take(ATTACHMENT_CHAR_LIMIT).collect();
        format!("{} [truncated]", cut)
    } else {
        body
    };
    format!("- {}{}: {}", kind, label, body)
}

fn format_requirements(prefs: &Preferences) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(format) = prefs.format {
        let text = match format {
            OutputFormat::Prose => "Format: prose paragraphs",
            OutputFormat::Bullets => "Format: bullet points",
            OutputFormat::Table => "Format: a table where the data allows",
            OutputFormat::Soap => "Format: SOAP note (Subjective, Objective, Assessment, Plan)",
        };
        lines.push(text.to_string());
    }
    if let Some(length) = prefs.length {
        let text = match length {
            OutputLength::Brief => "Length: brief, a few sentences",
            OutputLength::Standard => "Length: standard",
            OutputLength::Detailed => "Length: detailed",
        };
        lines.push(text.to_string());
    }
    if prefs.include_citations {
        lines.push("Cite sources for clinical claims as [n] with a Source: line for each".to_string());
    }
    if prefs.simplify {
        lines.push("Use plain language at about a 6th-grade reading level".to_string());
    }
    lines
}

impl PacketBuilder {
    pub fn new(policy: Arc<ModelPolicy>) -> Self {
        Self { policy }
    }

    fn model_family(&self, prefs: Option<&Preferences>) -> String {
        let tier = prefs.and_then(|p| p.model).map(|t| t.as_str()).unwrap_or("smart");
        self.policy
            .family_for_tier(tier)
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.policy.restricted_model.clone())
    }

    pub fn build(&self, req: &ProcessRequest, context_window: Vec<String>) -> Result<BuiltPacket, MediatorError> {
        let task = req
            .task
            .ok_or_else(|| MediatorError::Validation("task type is required".to_string()))?;
        if req.input.trim().is_empty() {
            return Err(MediatorError::Validation("input text is required".to_string()));
        }

        let role = Role::parse(&req.role);
        let strict = is_lower_trust(role, &req.department);
        let overrides = req.security.clone().unwrap_or_default();
        let prefs = req.preferences.as_ref();
        let mut notes = Vec::new();
        let mut flags = Vec::new();

        let default_safety = if strict { SafetyMode::Maximum } else { SafetyMode::High };
        let safety_mode = match overrides.safety_mode {
            // Lower-trust callers may tighten but never loosen
            Some(requested) if strict => requested.max(default_safety),
            Some(requested) => requested,
            None => default_safety,
        };

        let redact = match overrides.redact_phi {
            Some(false) if strict => {
                warn!("User {} ({}) tried to disable PHI redaction; denied", req.user_id, req.role);
                flags.push(FLAG_PHI_OVERRIDE_DENIED.to_string());
                notes.push("request to disable PHI redaction was denied for this role".to_string());
                true
            }
            Some(v) => v,
            None => true,
        };

        let max_tokens = overrides
            .max_tokens
            .or_else(|| prefs.and_then(|p| p.length).map(|l| l.max_tokens()))
            .unwrap_or(DEFAULT_MAX_TOKENS);

        // Prompt: input, attachments, output requirements
        let mut prompt = req.input.trim().to_string();
        if !req.attachments.is_empty() {
            prompt.push_str("\n\n[Attached clinical data]\n");
            let lines: Vec<String> = req.attachments.iter().map(describe_attachment).collect();
            prompt.push_str(&lines.join("\n"));
        }
        if let Some(p) = prefs {
            let reqs = format_requirements(p);
            if !reqs.is_empty() {
                prompt.push_str("\n\n[Output requirements]\n");
                for line in reqs {
                    prompt.push_str("- ");
                    prompt.push_str(&line);
                    prompt.push('\n');
                }
                prompt.truncate(prompt.trim_end().len());
            }
        }

        let raw_hash = content_hash(&[&req.user_id, &req.role, &req.department, task.intent(), &prompt]);

        let phi_present = contains_phi(&prompt) || context_window.iter().any(|t| contains_phi(t));
        if phi_present {
            flags.push(FLAG_PHI_DETECTED.to_string());
        }

        let mut input_redactions = 0;
        let mut input_excerpt = req.input.trim().to_string();
        let context_window = if redact {
            let redacted = redact_phi(&prompt);
            input_redactions = redacted.redaction_count;
            prompt = redacted.text;
            input_excerpt = redact_phi(&input_excerpt).text;
            context_window.iter().map(|t| redact_phi(t).text).collect()
        } else {
            context_window
        };
        if input_redactions > 0 {
            debug!("Redacted {} identifier span(s) from input", input_redactions);
            notes.push(format!("{} identifier(s) redacted from input", input_redactions));
        }

        let (source_ip, user_agent) = req
            .metadata
            .as_ref()
            .map(|m| (m.ip.clone(), m.user_agent.clone()))
            .unwrap_or((None, None));

        let packet = ContextPacket {
            version: PROTOCOL_VERSION.to_string(),
            user: UserContext {
                id: req.user_id.clone(),
                role: req.role.trim().to_lowercase(),
                department: req.department.clone(),
                session_id: req.session_id.clone().unwrap_or_default(),
                clearance_level: None,
            },
            task: TaskSpec {
                intent: task.intent().to_string(),
                model_family: self.model_family(prefs),
                output_kind: task.output_kind(),
            },
            inputs: Inputs {
                prompt,
                data_refs: req.attachments.iter().filter_map(|a| a.reference.clone()).collect(),
                context_window,
            },
            constraints: Constraints {
                max_tokens,
                redact_phi: redact,
                safety_mode,
                timeout_ms: overrides.timeout_ms,
            },
            routing: RoutingHints {
                target_agent: task.agent_name().to_string(),
                use_fallback: overrides.use_fallback.unwrap_or(true),
                priority: None,
            },
            audit: AuditMeta {
                request_time: Utc::now(),
                source_ip,
                user_agent,
                content_hash: raw_hash,
                compliance_flags: flags,
            },
        };
        packet.validate()?;

        Ok(BuiltPacket {
            packet,
            input_excerpt,
            input_redactions,
            notes,
        })
    }
}
