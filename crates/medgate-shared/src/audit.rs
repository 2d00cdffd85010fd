//! Model Call Audit record and query filter.
//!
//! One record per terminal outcome. Records are append-only: nothing in the
//! system updates one after it is written. Input and output are stored as
//! hashes, the packet snapshot is stored as built (already redacted when
//! the caller asked for redaction).

use crate::packet::ContextPacket;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Model name recorded when no model produced output (rejection, exhausted cascade)
pub const MODEL_NONE: &str = "none";

/// Model name recorded for unexpected internal errors
pub const MODEL_ERROR_SENTINEL: &str = "ERROR";

/// Compliance retention window: 7 years
pub const AUDIT_RETENTION_DAYS: i64 = 7 * 365 + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    CascadeExhausted,
    SecurityRejected,
    InternalError,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::CascadeExhausted => "cascade_exhausted",
            AuditOutcome::SecurityRejected => "security_rejected",
            AuditOutcome::InternalError => "internal_error",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCallAudit {
    pub id: String,
    pub user_id: String,
    pub model_used: String,
    /// Task intent, the key analytics groups on
    pub task: String,
    pub input_hash: String,
    pub output_hash: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub packet: ContextPacket,
    pub fallback_triggered: bool,
    pub response_time_ms: u64,
    pub token_usage: TokenUsage,
    pub safety_violations: Option<Vec<String>>,
    pub phi_detected: bool,
    pub outcome: AuditOutcome,
    pub error_code: Option<String>,
}

impl ModelCallAudit {
    /// Start a record for `packet`; outcome fields are filled by the caller
    pub fn for_packet(packet: &ContextPacket, outcome: AuditOutcome, model_used: &str) -> Self {
        Self {
            id: new_audit_id(),
            user_id: packet.user.id.clone(),
            model_used: model_used.to_string(),
            task: packet.task.intent.clone(),
            input_hash: packet.audit.content_hash.clone(),
            output_hash: None,
            timestamp: Utc::now(),
            packet: packet.clone(),
            fallback_triggered: false,
            response_time_ms: 0,
            token_usage: TokenUsage::default(),
            safety_violations: None,
            phi_detected: packet.phi_detected(),
            outcome,
            error_code: None,
        }
    }

    /// Day bucket used by the secondary index
    pub fn day_key(&self) -> String {
        day_key(&self.timestamp)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.timestamp < retention_cutoff(now)
    }
}

pub fn new_audit_id() -> String {
    format!("aud-{}", Uuid::new_v4())
}

pub fn day_key(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d").to_string()
}

pub fn retention_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::days(AUDIT_RETENTION_DAYS)
}

/// Filters for audit queries. All set fields must match; `end` is exclusive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditFilter {
    pub user_id: Option<String>,
    pub model_name: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn matches(&self, record: &ModelCallAudit) -> bool {
        if let Some(u) = &self.user_id {
            if &record.user_id != u {
                return false;
            }
        }
        if let Some(m) = &self.model_name {
            if &record.model_used != m {
                return false;
            }
        }
        if let Some(start) = self.start {
            if record.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if record.timestamp >= end {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::tests::sample_packet;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique() {
        let ids: HashSet<String> = (0..1000).map(|_| new_audit_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_for_packet_copies_identity() {
        let p = sample_packet();
        let rec = ModelCallAudit::for_packet(&p, AuditOutcome::SecurityRejected, MODEL_NONE);
        assert_eq!(rec.user_id, "u-1");
        assert_eq!(rec.model_used, MODEL_NONE);
        assert_eq!(rec.input_hash, p.audit.content_hash);
        assert_eq!(rec.packet, p);
    }

    #[test]
    fn test_filter_matches() {
        let rec = ModelCallAudit::for_packet(&sample_packet(), AuditOutcome::Success, "m1");
        assert!(AuditFilter::default().matches(&rec));
        assert!(AuditFilter { user_id: Some("u-1".into()), ..Default::default() }.matches(&rec));
        assert!(!AuditFilter { model_name: Some("m2".into()), ..Default::default() }.matches(&rec));
        let later = rec.timestamp + Duration::seconds(1);
        assert!(!AuditFilter { start: Some(later), ..Default::default() }.matches(&rec));
        assert!(!AuditFilter { end: Some(rec.timestamp), ..Default::default() }.matches(&rec));
    }

    #[test]
    fn test_retention() {
        let mut rec = ModelCallAudit::for_packet(&sample_packet(), AuditOutcome::Success, "m1");
        let now = Utc::now();
        assert!(!rec.is_expired(now));
        rec.timestamp = now - Duration::days(AUDIT_RETENTION_DAYS + 1);
        assert!(rec.is_expired(now));
    }

    #[test]
    fn test_outcome_serializes_snake_case() {
        let json = serde_json::to_string(&AuditOutcome::CascadeExhausted).unwrap();
        assert_eq!(json, "\"cascade_exhausted\"");
    }
}
