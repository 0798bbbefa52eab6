//! Configuration
//!
//! Shared closed enums, the sandbox configuration, its JSON file form and validation.

pub mod config;
pub mod types;
pub mod validator;
