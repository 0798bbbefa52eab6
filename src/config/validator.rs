// Config validation
// Fail fast at startup with actionable errors; warnings are logged only.

use crate::config::types::{BoundaryKind, Result, SandboxConfig, SandboxError};
use std::time::Duration;

/// Largest accepted wall-clock budget
pub const MAX_TIMEOUT: Duration = Duration::from_secs(600);

/// Smallest accepted wall-clock budget; timeout labels have millisecond resolution
pub const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate a sandbox configuration. Any error is fatal.
pub fn validate_config(config: &SandboxConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_timeout(config, &mut result);
    validate_output_limits(config, &mut result);
    validate_worker(config, &mut result);

    for warning in &result.warnings {
        log::warn!("config: {}", warning);
    }

    if !result.is_valid() {
        return Err(SandboxError::Config(format!(
            "config validation failed:\n{}",
            result.errors.join("\n")
        )));
    }

    Ok(result)
}

fn validate_timeout(config: &SandboxConfig, result: &mut ValidationResult) {
    if config.timeout.is_zero() {
        result.add_error("timeout cannot be zero".to_string());
    } else if config.timeout < MIN_TIMEOUT {
        result.add_error(format!(
            "timeout {}us is below the 1ms minimum",
            config.timeout.as_micros()
        ));
    } else if config.timeout > MAX_TIMEOUT {
        result.add_error(format!(
            "timeout {}ms exceeds the {}s maximum",
            config.timeout.as_millis(),
            MAX_TIMEOUT.as_secs()
        ));
    } else if config.timeout < Duration::from_millis(50) {
        result.add_warning(format!(
            "timeout {}ms is very low, most scripts will time out",
            config.timeout.as_millis()
        ));
    }
}

fn validate_output_limits(config: &SandboxConfig, result: &mut ValidationResult) {
    if config.output_limits.max_lines == 0 {
        result.add_error("output.max_lines cannot be zero".to_string());
    }
    if config.output_limits.max_line_bytes == 0 {
        result.add_error("output.max_line_bytes cannot be zero".to_string());
    }
}

fn validate_worker(config: &SandboxConfig, result: &mut ValidationResult) {
    match (&config.worker_program, config.boundary) {
        (Some(program), BoundaryKind::Process) if !program.exists() => {
            result.add_error(format!(
                "worker program {} does not exist",
                program.display()
            ));
        }
        (Some(program), BoundaryKind::Thread) => {
            result.add_warning(format!(
                "worker program {} is ignored by the thread boundary",
                program.display()
            ));
        }
        _ => {}
    }
}
