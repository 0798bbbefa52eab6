/// Core types and structures for the scriptbox system
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::transform::TransformError;

/// Monotonic run identifier. Events tagged with an older generation are stale.
pub type Generation = u64;

/// Severity of one captured output line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl Severity {
    /// Marker prepended by the display surface, if any
    pub fn marker(self) -> Option<&'static str> {
        match self {
            Severity::Info => None,
            Severity::Warn => Some("⚠️"),
            Severity::Error => Some("❌"),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warn => write!(f, "warn"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// Console channel a message was emitted on inside the context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleMethod {
    Log,
    Info,
    Debug,
    Warn,
    Error,
}

impl ConsoleMethod {
    pub const ALL: [ConsoleMethod; 5] = [
        ConsoleMethod::Log,
        ConsoleMethod::Info,
        ConsoleMethod::Debug,
        ConsoleMethod::Warn,
        ConsoleMethod::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConsoleMethod::Log => "log",
            ConsoleMethod::Info => "info",
            ConsoleMethod::Debug => "debug",
            ConsoleMethod::Warn => "warn",
            ConsoleMethod::Error => "error",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|method| method.as_str() == name)
    }

    pub fn severity(self) -> Severity {
        match self {
            ConsoleMethod::Log | ConsoleMethod::Info | ConsoleMethod::Debug => Severity::Info,
            ConsoleMethod::Warn => Severity::Warn,
            ConsoleMethod::Error => Severity::Error,
        }
    }
}

/// Terminal signal of a run. Exactly one per generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunOutcome {
    Completed,
    TimedOut,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::TimedOut => write!(f, "timed-out"),
        }
    }
}

/// Isolation primitive that hosts an execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundaryKind {
    /// Dedicated OS thread with its own engine instance
    #[default]
    Thread,
    /// Worker subprocess in its own process group
    Process,
}

impl fmt::Display for BoundaryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundaryKind::Thread => write!(f, "thread"),
            BoundaryKind::Process => write!(f, "process"),
        }
    }
}

impl FromStr for BoundaryKind {
    type Err = SandboxError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "thread" => Ok(BoundaryKind::Thread),
            "process" => Ok(BoundaryKind::Process),
            other => Err(SandboxError::Config(format!(
                "unknown boundary '{other}' (expected thread or process)"
            ))),
        }
    }
}

/// What happens to output a context produces after it signalled completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LateOutputPolicy {
    /// Deliver until the context ends or its deadline tears it down
    #[default]
    Deliver,
    /// Drop everything after the completed signal
    Drop,
}

/// Bounds applied to the host-side display log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLimits {
    /// Maximum number of lines kept between clears
    pub max_lines: usize,
    /// Maximum bytes kept per line
    pub max_line_bytes: usize,
}

impl Default for OutputLimits {
    fn default() -> Self {
        OutputLimits {
            max_lines: 1000,
            max_line_bytes: 64 * 1024,
        }
    }
}

/// Whether the display log kept everything it was given
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputIntegrity {
    Complete,
    Truncated,
}

impl fmt::Display for OutputIntegrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputIntegrity::Complete => write!(f, "complete"),
            OutputIntegrity::Truncated => write!(f, "truncated"),
        }
    }
}

/// Default wall-clock budget per run
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Sandbox configuration
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Wall-clock budget, measured from context creation
    pub timeout: Duration,
    pub boundary: BoundaryKind,
    /// Worker executable for the process boundary (defaults to the current executable)
    pub worker_program: Option<PathBuf>,
    pub late_output: LateOutputPolicy,
    pub output_limits: OutputLimits,
    /// Append audit events as JSON lines to this file
    pub audit_log: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            boundary: BoundaryKind::Thread,
            worker_program: None,
            late_output: LateOutputPolicy::Deliver,
            output_limits: OutputLimits::default(),
            audit_log: None,
        }
    }
}

impl SandboxConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_boundary(mut self, boundary: BoundaryKind) -> Self {
        self.boundary = boundary;
        self
    }

    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    pub fn with_late_output(mut self, policy: LateOutputPolicy) -> Self {
        self.late_output = policy;
        self
    }

    /// Human form of the budget used in the timeout line, e.g. `5s` or `250ms`
    pub fn timeout_label(&self) -> String {
        let millis = self.timeout.as_millis();
        if millis % 1000 == 0 {
            format!("{}s", millis / 1000)
        } else {
            format!("{millis}ms")
        }
    }
}

/// Error types for sandbox operations
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transformation Error: {0}")]
    Transform(#[from] TransformError),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Boundary error: {0}")]
    Boundary(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Run {0} has not signalled termination yet")]
    RunInProgress(Generation),

    #[error("Execution context disconnected")]
    Disconnected,
}

pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_method_severity_mapping() {
        assert_eq!(ConsoleMethod::Log.severity(), Severity::Info);
        assert_eq!(ConsoleMethod::Debug.severity(), Severity::Info);
        assert_eq!(ConsoleMethod::Warn.severity(), Severity::Warn);
        assert_eq!(ConsoleMethod::Error.severity(), Severity::Error);
    }

    #[test]
    fn test_console_method_names() {
        for method in ConsoleMethod::ALL {
            assert_eq!(ConsoleMethod::from_name(method.as_str()), Some(method));
        }
        assert_eq!(ConsoleMethod::from_name("table"), None);
    }

    #[test]
    fn test_run_outcome_wire_names() {
        assert_eq!(
            serde_json::to_string(&RunOutcome::TimedOut).unwrap(),
            "\"timed-out\""
        );
        assert_eq!(RunOutcome::Completed.to_string(), "completed");
    }

    #[test]
    fn test_boundary_kind_parse() {
        assert_eq!("Process".parse::<BoundaryKind>().unwrap(), BoundaryKind::Process);
        assert_eq!(" thread ".parse::<BoundaryKind>().unwrap(), BoundaryKind::Thread);
        assert!(matches!(
            "vm".parse::<BoundaryKind>(),
            Err(SandboxError::Config(_))
        ));
    }

    #[test]
    fn test_transform_error_display() {
        let err = crate::transform::Transformer::new()
            .transform("let = 1")
            .unwrap_err();
        let message = err.message.clone();
        assert_eq!(
            SandboxError::from(err).to_string(),
            format!("Transformation Error: {message}")
        );
    }

    #[test]
    fn test_timeout_label() {
        let config = SandboxConfig::default();
        assert_eq!(config.timeout_label(), "5s");
        let config = config.with_timeout(Duration::from_millis(250));
        assert_eq!(config.timeout_label(), "250ms");
    }
}
