//! scriptbox: an isolated JavaScript snippet runner
//! Runs untrusted snippets one at a time in a disposable execution context and
//! turns their console output, failures and completion into host events.
//!
//! # Architecture
//!
//! ## Transformation ([`transform`])
//! - [`transform::Transformer`]: source text to executable script text
//! - [`transform::modules`]: lexical lowering of `import`/`export` syntax
//!
//! ## Runtime Core ([`core`])
//! - [`core::supervisor`]: host-side run lifecycle, generations and the wall-clock cutoff
//! - [`core::boundary`]: thread and worker-process isolation boundaries
//! - [`core::context`]: evaluation, microtask checkpoints and the timer loop
//! - [`core::harness`]: console capture, timers and rejection tracking installed into the engine
//! - [`core::timers`]: deterministic timer queue
//! - [`core::worker`]: worker-process role speaking JSON lines on stdio
//! - [`core::types`]: messages, envelopes and host events
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: structured run lifecycle events
//!
//! ## Configuration ([`config`])
//! - [`config::config`]: `scriptbox.json` loading
//! - [`config::validator`]: configuration validation
//! - [`config::types`]: shared type definitions and closed enums
//!
//! ## Utilities ([`utils`])
//! - [`utils::output`]: bounded display log
//!
//! # Design Principles
//!
//! 1. **One live context** - a new run or a reset retires the previous context first
//! 2. **Generations filter everything** - messages from an abandoned run never reach the log
//! 3. **Exactly one terminal** - every run ends with one `completed` or `timed-out` event
//! 4. **Messages only** - contexts share no state with the host

// Transformation
pub mod transform;

// Runtime core
pub mod core;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// CLI entrypoint wiring for the scriptbox binary.
pub mod cli;

// Re-export commonly used types for convenience
pub use crate::config::types::*;
pub use crate::core::supervisor::Sandbox;
pub use crate::core::types::{HostEvent, OutputEvent, RunReport};
pub use crate::transform::{ExecutableText, TransformError, Transformer};
