//! medgated - governed AI request mediator daemon.
//!
//! Owns everything with I/O: configuration, provider backends, audit
//! storage, the session cache and the HTTP surface. Protocol and policy
//! types live in `medgate-shared`.

pub mod audit;
pub mod audit_store;
pub mod builder;
pub mod config;
pub mod executor;
pub mod mediator;
pub mod provider;
pub mod routes;
pub mod server;
pub mod session;

pub use mediator::{MaintenanceReport, Mediator};
