//! Request/response protocol of the mediator facade.

use crate::error::{ErrorInfo, MediatorError};
use crate::packet::{OutputKind, SafetyMode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    ClinicalSummary,
    DiagnosisSupport,
    TreatmentPlan,
    LabInterpretation,
    PatientEducation,
    Documentation,
    ResearchQuery,
}

impl TaskKind {
    /// Natural-language intent placed in the packet
    pub fn intent(&self) -> &'static str {
        match self {
            TaskKind::ClinicalSummary => "Summarize the patient's clinical history and current status",
            TaskKind::DiagnosisSupport => "Suggest a differential diagnosis with supporting evidence",
            TaskKind::TreatmentPlan => "Propose an evidence-based treatment plan",
            TaskKind::LabInterpretation => "Interpret laboratory results and flag abnormal values",
            TaskKind::PatientEducation => "Explain the condition and care plan to the patient",
            TaskKind::Documentation => "Draft clinical documentation",
            TaskKind::ResearchQuery => "Answer a clinical research question from the literature",
        }
    }

    pub fn output_kind(&self) -> OutputKind {
        match self {
            TaskKind::ClinicalSummary => OutputKind::Summary,
            TaskKind::DiagnosisSupport | TaskKind::LabInterpretation => OutputKind::Analysis,
            TaskKind::TreatmentPlan => OutputKind::Plan,
            TaskKind::Documentation => OutputKind::Document,
            TaskKind::PatientEducation | TaskKind::ResearchQuery => OutputKind::Text,
        }
    }

    pub fn agent_name(&self) -> &'static str {
        match self {
            TaskKind::ClinicalSummary => "clinical-summary-agent",
            TaskKind::DiagnosisSupport => "diagnosis-support-agent",
            TaskKind::TreatmentPlan => "treatment-planning-agent",
            TaskKind::LabInterpretation => "lab-interpretation-agent",
            TaskKind::PatientEducation => "patient-education-agent",
            TaskKind::Documentation => "documentation-agent",
            TaskKind::ResearchQuery => "research-agent",
        }
    }
}

/// Abstract model preference; the policy maps it to a concrete family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Smart,
    Fast,
    Local,
    Precise,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Smart => "smart",
            ModelTier::Fast => "fast",
            ModelTier::Local => "local",
            ModelTier::Precise => "precise",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    StructuredRecord,
    LabResults,
    ClinicalNotes,
    Imaging,
    Other,
}

/// Clinical data supplied by the retrieval layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    #[serde(default)]
    pub label: Option<String>,
    /// Reference into the clinical data store, kept in the packet's data refs
    #[serde(default)]
    pub reference: Option<String>,
    pub content: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Prose,
    Bullets,
    Table,
    Soap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLength {
    Brief,
    Standard,
    Detailed,
}

impl OutputLength {
    pub fn max_tokens(&self) -> u32 {
        match self {
            OutputLength::Brief => 512,
            OutputLength::Standard => 1024,
            OutputLength::Detailed => 2048,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    pub model: Option<ModelTier>,
    pub format: Option<OutputFormat>,
    pub length: Option<OutputLength>,
    #[serde(default)]
    pub include_citations: bool,
    /// Rewrite at a plain-language reading level
    #[serde(default)]
    pub simplify: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityOverrides {
    pub redact_phi: Option<bool>,
    pub safety_mode: Option<SafetyMode>,
    pub max_tokens: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub use_fallback: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub user_id: String,
    pub role: String,
    pub department: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub task: Option<TaskKind>,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub preferences: Option<Preferences>,
    #[serde(default)]
    pub security: Option<SecurityOverrides>,
    #[serde(default)]
    pub metadata: Option<RequestMetadata>,
}

impl ProcessRequest {
    /// Minimal request, mostly for tests and workflow steps
    pub fn new(user_id: &str, role: &str, department: &str, task: TaskKind, input: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            role: role.to_string(),
            department: department.to_string(),
            session_id: None,
            task: Some(task),
            input: input.to_string(),
            attachments: Vec::new(),
            preferences: None,
            security: None,
            metadata: None,
        }
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn with_security(mut self, security: SecurityOverrides) -> Self {
        self.security = Some(security);
        self
    }

    pub fn with_preferences(mut self, preferences: Preferences) -> Self {
        self.preferences = Some(preferences);
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub citations: Vec<String>,
    pub actionable_items: Vec<String>,
    pub follow_ups: Vec<String>,
    pub safety_warnings: Vec<String>,
    pub fallback_used: bool,
    pub phi_redacted: bool,
    pub routing_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessResponse {
    pub success: bool,
    pub output: Option<String>,
    /// Penalty-based heuristic in [0, 1]; not a calibrated probability
    pub confidence: f32,
    pub model_used: Option<String>,
    pub processing_time_ms: u64,
    pub metadata: ResponseMetadata,
    pub audit_id: Option<String>,
    pub error: Option<ErrorInfo>,
}

impl ProcessResponse {
    pub fn failure(err: &MediatorError, processing_time_ms: u64, audit_id: Option<String>) -> Self {
        Self {
            success: false,
            output: None,
            confidence: 0.0,
            model_used: None,
            processing_time_ms,
            metadata: ResponseMetadata::default(),
            audit_id,
            error: Some(err.to_info()),
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow: String,
    pub success: bool,
    /// Responses of the steps that completed, in order
    pub results: Vec<ProcessResponse>,
    pub total_time_ms: u64,
    pub error: Option<ErrorInfo>,
}

// =============================================================================
// Confidence heuristic
// =============================================================================

pub const CONFIDENCE_BASE: f32 = 0.9;
pub const CONFIDENCE_FALLBACK_PENALTY: f32 = 0.15;
pub const CONFIDENCE_WARNING_PENALTY: f32 = 0.1;
pub const CONFIDENCE_REDACTION_PENALTY: f32 = 0.05;

/// Base score minus fixed deductions; a heuristic, not a probability
pub fn confidence_heuristic(fallback_used: bool, warnings: usize, output_redacted: bool) -> f32 {
    let mut score = CONFIDENCE_BASE;
    if fallback_used {
        score -= CONFIDENCE_FALLBACK_PENALTY;
    }
    score -= CONFIDENCE_WARNING_PENALTY * warnings as f32;
    if output_redacted {
        score -= CONFIDENCE_REDACTION_PENALTY;
    }
    score.clamp(0.0, 1.0)
}

// =============================================================================
// Output metadata extraction
// =============================================================================

static CITATION_MARKER: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\[(\d{1,3})\]").ok());

static ACTION_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(?:[-*]\s*\[ \]\s*|action:\s*|todo:\s*|next step:\s*)(.+)$").ok());

static SOURCE_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(?:source|reference|ref)s?:\s*(.+)$").ok());

/// Pull citations, action items and follow-up questions out of model text
pub fn extract_metadata(text: &str) -> (Vec<String>, Vec<String>, Vec<String>) {
    let mut citations = Vec::new();
    let mut actions = Vec::new();
    let mut follow_ups = Vec::new();

    if let Some(re) = CITATION_MARKER.as_ref() {
        for cap in re.captures_iter(text) {
            let c = format!("[{}]", &cap[1]);
            if !citations.contains(&c) {
                citations.push(c);
            }
        }
    }

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(cap) = SOURCE_LINE.as_ref().and_then(|re| re.captures(trimmed)) {
            citations.push(cap[1].trim().to_string());
            continue;
        }
        if let Some(cap) = ACTION_LINE.as_ref().and_then(|re| re.captures(trimmed)) {
            actions.push(cap[1].trim().to_string());
            continue;
        }
        if trimmed.ends_with('?') {
            follow_ups.push(trimmed.trim_start_matches(['-', '*', ' ']).to_string());
        }
    }

    (citations, actions, follow_ups)
}
