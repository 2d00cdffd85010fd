//! Context Packet: the canonical, versioned envelope for one AI invocation.
//!
//! A packet is built once per call and never mutated afterwards. The same
//! value travels through screening, routing and execution and is finally
//! stored verbatim as the audit snapshot, so anything sensitive must already
//! be redacted by the time the packet exists.

use crate::error::MediatorError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Protocol version every packet must carry
pub const PROTOCOL_VERSION: &str = "1.0";

/// Caller roles known to the access matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Clinician,
    Oncologist,
    Nurse,
    Technician,
    Researcher,
    Admin,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::Clinician,
        Role::Oncologist,
        Role::Nurse,
        Role::Technician,
        Role::Researcher,
        Role::Admin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Clinician => "clinician",
            Role::Oncologist => "oncologist",
            Role::Nurse => "nurse",
            Role::Technician => "technician",
            Role::Researcher => "researcher",
            Role::Admin => "admin",
        }
    }

    /// Case-insensitive lookup; `None` for anything outside the enumeration
    pub fn parse(s: &str) -> Option<Role> {
        let s = s.trim().to_lowercase();
        Role::ALL.into_iter().find(|r| r.as_str() == s)
    }

    /// Roles whose requests default to the strictest handling
    pub fn is_lower_trust(&self) -> bool {
        matches!(self, Role::Technician | Role::Researcher)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyMode {
    Low,
    Medium,
    High,
    Maximum,
}

impl fmt::Display for SafetyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SafetyMode::Low => "low",
            SafetyMode::Medium => "medium",
            SafetyMode::High => "high",
            SafetyMode::Maximum => "maximum",
        };
        f.write_str(s)
    }
}

/// What the caller expects back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Text,
    Summary,
    Analysis,
    Plan,
    Document,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    Urgent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub id: String,
    /// Raw role string as supplied by the identity layer
    pub role: String,
    pub department: String,
    pub session_id: String,
    pub clearance_level: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub intent: String,
    /// Requested model family (may be downgraded by the router)
    pub model_family: String,
    pub output_kind: OutputKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inputs {
    pub prompt: String,
    #[serde(default)]
    pub data_refs: Vec<String>,
    /// Short excerpt of prior turns in the same session
    #[serde(default)]
    pub context_window: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    pub max_tokens: u32,
    pub redact_phi: bool,
    pub safety_mode: SafetyMode,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingHints {
    pub target_agent: String,
    pub use_fallback: bool,
    pub priority: Option<Priority>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditMeta {
    pub request_time: DateTime<Utc>,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
    pub content_hash: String,
    #[serde(default)]
    pub compliance_flags: Vec<String>,
}

/// Compliance flag set when identifier-like spans were found in the input
pub const FLAG_PHI_DETECTED: &str = "phi_detected";

/// Compliance flag set when a caller tried to disable redaction without the right to
pub const FLAG_PHI_OVERRIDE_DENIED: &str = "phi_override_denied";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPacket {
    pub version: String,
    pub user: UserContext,
    pub task: TaskSpec,
    pub inputs: Inputs,
    pub constraints: Constraints,
    pub routing: RoutingHints,
    pub audit: AuditMeta,
}

impl ContextPacket {
    /// Check protocol invariants. Called once by the builder; a packet that
    /// fails here never reaches screening or routing.
    pub fn validate(&self) -> Result<(), MediatorError> {
        if self.version != PROTOCOL_VERSION {
            return Err(MediatorError::Validation(format!(
                "unsupported protocol version '{}' (expected {})",
                self.version, PROTOCOL_VERSION
            )));
        }
        if Role::parse(&self.user.role).is_none() {
            return Err(MediatorError::Validation(format!(
                "unknown role '{}'",
                self.user.role
            )));
        }
        if self.user.id.trim().is_empty() {
            return Err(MediatorError::Validation("user id is empty".to_string()));
        }
        if self.task.intent.trim().is_empty() {
            return Err(MediatorError::Validation("task intent is empty".to_string()));
        }
        if self.constraints.max_tokens == 0 {
            return Err(MediatorError::Validation("max_tokens must be positive".to_string()));
        }
        Ok(())
    }

    pub fn role(&self) -> Option<Role> {
        Role::parse(&self.user.role)
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.audit.compliance_flags.iter().any(|f| f == flag)
    }

    pub fn phi_detected(&self) -> bool {
        self.has_flag(FLAG_PHI_DETECTED)
    }

    /// Prompt text handed to the provider
    pub fn render_prompt(&self) -> String {
        let mut out = format!("Task: {}\n", self.task.intent);
        if !self.inputs.context_window.is_empty() {
            out.push_str("\n[Recent context]\n");
            for turn in &self.inputs.context_window {
                out.push_str("- ");
                out.push_str(turn);
                out.push('\n');
            }
        }
        out.push('\n');
        out.push_str(&self.inputs.prompt);
        out
    }
}

/// Hex SHA-256 of the given parts, separated so that ("ab","c") != ("a","bc")
pub fn content_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}
