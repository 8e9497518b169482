//! Observability
//!
//! Structured audit trail for policy decisions and lifecycle transitions.

pub mod audit;
