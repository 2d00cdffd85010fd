//! Error types for medgate.
//!
//! Every failure a caller can observe maps onto one variant here. The
//! machine-readable `code()` is what lands in the structured error of a
//! response and in the audit record's error field.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediatorError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Request blocked by security screening: {}", .categories.join(", "))]
    SecurityViolation { categories: Vec<String>, risk_score: f32 },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("All models failed after trying {}: {last_error}", .attempted.join(" -> "))]
    CascadeExhausted {
        attempted: Vec<String>,
        last_error: String,
    },

    #[error("Audit store error: {0}")]
    AuditStore(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MediatorError {
    pub fn code(&self) -> &'static str {
        match self {
            MediatorError::Validation(_) => "VALIDATION_ERROR",
            MediatorError::SecurityViolation { .. } => "SECURITY_VIOLATION",
            MediatorError::PermissionDenied(_) => "PERMISSION_DENIED",
            MediatorError::UnknownWorkflow(_) => "UNKNOWN_WORKFLOW",
            MediatorError::CascadeExhausted { .. } => "ALL_MODELS_FAILED",
            MediatorError::AuditStore(_) => "AUDIT_STORE_ERROR",
            MediatorError::Json(_) => "INTERNAL_ERROR",
            MediatorError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Remediation hints shown to the caller alongside the error.
    pub fn suggestions(&self) -> Vec<String> {
        let hints: &[&str] = match self {
            MediatorError::Validation(_) => &[
                "Provide a task type and non-empty input text",
                "Check that the role is one of: clinician, oncologist, nurse, technician, researcher, admin",
            ],
            MediatorError::SecurityViolation { .. } => &[
                "Rephrase the request without instructions aimed at the assistant itself",
                "Remove content outside clinical scope",
                "Contact the security team if you believe this is a false positive",
            ],
            MediatorError::PermissionDenied(_) => &[
                "Ask an administrator to review your role assignment",
                "Use a workflow available to your role",
            ],
            MediatorError::UnknownWorkflow(_) => &["List available workflows and retry with a known name"],
            MediatorError::CascadeExhausted { .. } => &[
                "Retry the request in a few minutes",
                "Reduce the input size or requested length",
                "Contact support if the problem persists",
            ],
            MediatorError::AuditStore(_) | MediatorError::Json(_) | MediatorError::Internal(_) => &[
                "Retry the request",
                "Contact support with the audit reference if the problem persists",
            ],
        };
        hints.iter().map(|h| h.to_string()).collect()
    }

    /// Structured form returned to callers.
    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo {
            message: self.to_string(),
            code: self.code().to_string(),
            suggestions: self.suggestions(),
        }
    }
}

/// Structured error carried in a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    pub code: String,
    pub suggestions: Vec<String>,
}
