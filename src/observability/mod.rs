//! Observability
//!
//! Structured run lifecycle audit events.

pub mod audit;
