/// Configuration loading from scriptbox.json
use crate::config::types::{
    BoundaryKind, LateOutputPolicy, OutputLimits, Result, SandboxConfig, SandboxError,
};
use crate::config::validator::validate_config;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name looked up in the current directory by [`ScriptboxConfig::load_default`]
pub const DEFAULT_CONFIG_FILE: &str = "scriptbox.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxSection {
    pub timeout_ms: Option<u64>,
    pub boundary: Option<BoundaryKind>,
    pub worker_program: Option<PathBuf>,
    pub late_output: Option<LateOutputPolicy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputSection {
    pub max_lines: Option<usize>,
    pub max_line_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuditSection {
    pub log_path: Option<PathBuf>,
}

/// Full scriptbox.json structure. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScriptboxConfig {
    pub sandbox: SandboxSection,
    pub output: OutputSection,
    pub audit: AuditSection,
}

impl ScriptboxConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config_content = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_json(&config_content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| SandboxError::Config(format!("Failed to parse config JSON: {}", e)))
    }

    /// Load ./scriptbox.json if present
    pub fn load_default() -> Result<Option<Self>> {
        let config_path = std::env::current_dir()
            .map_err(|e| SandboxError::Config(format!("Failed to get current directory: {}", e)))?
            .join(DEFAULT_CONFIG_FILE);

        if !config_path.exists() {
            log::debug!("no {} in current directory, using defaults", DEFAULT_CONFIG_FILE);
            return Ok(None);
        }

        Self::load_from_file(config_path).map(Some)
    }

    /// Overlay the file values on the built-in defaults and validate the result
    pub fn into_sandbox_config(self) -> Result<SandboxConfig> {
        let defaults = SandboxConfig::default();
        let default_limits = OutputLimits::default();

        let config = SandboxConfig {
            timeout: self
                .sandbox
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
            boundary: self.sandbox.boundary.unwrap_or(defaults.boundary),
            worker_program: self.sandbox.worker_program,
            late_output: self.sandbox.late_output.unwrap_or(defaults.late_output),
            output_limits: OutputLimits {
                max_lines: self.output.max_lines.unwrap_or(default_limits.max_lines),
                max_line_bytes: self
                    .output
                    .max_line_bytes
                    .unwrap_or(default_limits.max_line_bytes),
            },
            audit_log: self.audit.log_path,
        };

        validate_config(&config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_yields_defaults() {
        let config = ScriptboxConfig::from_json("{}")
            .unwrap()
            .into_sandbox_config()
            .unwrap();
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.boundary, BoundaryKind::Thread);
        assert_eq!(config.late_output, LateOutputPolicy::Deliver);
        assert_eq!(config.output_limits, OutputLimits::default());
        assert!(config.audit_log.is_none());
    }

    #[test]
    fn test_load_from_file_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "sandbox": {{ "timeout_ms": 1500, "late_output": "drop" }},
                "output": {{ "max_lines": 20 }},
                "audit": {{ "log_path": "/tmp/scriptbox-audit.log" }}
            }}"#
        )
        .unwrap();

        let config = ScriptboxConfig::load_from_file(file.path())
            .unwrap()
            .into_sandbox_config()
            .unwrap();
        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert_eq!(config.late_output, LateOutputPolicy::Drop);
        assert_eq!(config.output_limits.max_lines, 20);
        assert_eq!(config.output_limits.max_line_bytes, 64 * 1024);
        assert_eq!(
            config.audit_log.as_deref(),
            Some(Path::new("/tmp/scriptbox-audit.log"))
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = ScriptboxConfig::from_json(r#"{"sandbox": {"timeout": 5}}"#).unwrap_err();
        assert!(matches!(err, SandboxError::Config(_)));
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let config = ScriptboxConfig::from_json(r#"{"sandbox": {"timeout_ms": 0}}"#).unwrap();
        assert!(config.into_sandbox_config().is_err());
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ScriptboxConfig::load_from_file(dir.path().join("absent.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
