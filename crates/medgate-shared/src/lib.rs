//! Shared protocol and policy types for medgate.
//!
//! Everything here is pure: no I/O, no clocks beyond timestamps on new
//! records. The daemon crate owns providers, storage and the HTTP surface.

pub mod analytics;
pub mod audit;
pub mod error;
pub mod packet;
pub mod policy;
pub mod request;
pub mod routing;
pub mod screening;
pub mod workflow;

pub use analytics::{AnalyticsAccumulator, TaskCount, UsageAnalytics};
pub use audit::{AuditFilter, AuditOutcome, ModelCallAudit, TokenUsage, MODEL_ERROR_SENTINEL, MODEL_NONE};
pub use error::{ErrorInfo, MediatorError};
pub use packet::{ContextPacket, Role, SafetyMode, PROTOCOL_VERSION};
pub use policy::ModelPolicy;
pub use request::{ProcessRequest, ProcessResponse, ResponseMetadata, TaskKind, WorkflowResult};
pub use routing::{ModelRouter, RoutingDecision};
pub use screening::ScreeningReport;
pub use workflow::{WorkflowCatalog, WorkflowDefinition};

/// Crate version, reported by the health endpoint
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
