//! Usage analytics derived from audit records.
//!
//! Records are folded one at a time through `AnalyticsAccumulator`, so the
//! caller can stream pages out of the store without holding the whole
//! audit history in memory.

use crate::audit::{AuditOutcome, ModelCallAudit};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const DEFAULT_TOP_TASKS: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageAnalytics {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    pub fallback_rate: f64,
    pub phi_detected_calls: u64,
    pub total_tokens: u64,
    /// Most frequent tasks, descending, ties broken by name
    pub top_tasks: Vec<TaskCount>,
    pub model_usage: BTreeMap<String, u64>,
    /// Error code (or outcome when no code was recorded) -> count
    pub error_summary: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCount {
    pub task: String,
    pub count: u64,
}

#[derive(Debug, Default)]
pub struct AnalyticsAccumulator {
    total: u64,
    successful: u64,
    fallbacks: u64,
    phi: u64,
    tokens: u64,
    response_time_sum: u128,
    tasks: HashMap<String, u64>,
    models: BTreeMap<String, u64>,
    errors: BTreeMap<String, u64>,
}

impl AnalyticsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, record: &ModelCallAudit) {
        self.total += 1;
        self.response_time_sum += record.response_time_ms as u128;
        self.tokens += record.token_usage.total_tokens as u64;
        if record.fallback_triggered {
            self.fallbacks += 1;
        }
        if record.phi_detected {
            self.phi += 1;
        }
        *self.tasks.entry(record.task.clone()).or_insert(0) += 1;
        *self.models.entry(record.model_used.clone()).or_insert(0) += 1;

        if record.outcome == AuditOutcome::Success {
            self.successful += 1;
        } else {
            let key = record
                .error_code
                .clone()
                .unwrap_or_else(|| record.outcome.as_str().to_string());
            *self.errors.entry(key).or_insert(0) += 1;
        }
    }

    pub fn observed(&self) -> u64 {
        self.total
    }

    pub fn finish(self, top_n: usize) -> UsageAnalytics {
        if self.total == 0 {
            return UsageAnalytics::default();
        }

        let total = self.total as f64;
        let mut top_tasks: Vec<TaskCount> = self
            .tasks
            .into_iter()
            .map(|(task, count)| TaskCount { task, count })
            .collect();
        top_tasks.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.task.cmp(&b.task)));
        top_tasks.truncate(top_n);

        UsageAnalytics {
            total_calls: self.total,
            successful_calls: self.successful,
            success_rate: self.successful as f64 / total,
            avg_response_time_ms: self.response_time_sum as f64 / total,
            fallback_rate: self.fallbacks as f64 / total,
            phi_detected_calls: self.phi,
            total_tokens: self.tokens,
            top_tasks,
            model_usage: self.models,
            error_summary: self.errors,
        }
    }
}

/// Convenience for callers that already hold the records
pub fn summarize<'a, I>(records: I, top_n: usize) -> UsageAnalytics
where
    I: IntoIterator<Item = &'a ModelCallAudit>,
{
    let mut acc = AnalyticsAccumulator::new();
    for r in records {
        acc.observe(r);
    }
    acc.finish(top_n)
}
