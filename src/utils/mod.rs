//! Utilities
//!
//! Host-side output log.

pub mod output;
