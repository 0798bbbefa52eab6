/// Run lifecycle audit events for scriptbox
/// Structured logging of each run's start, termination and teardown so a
/// run can be followed across host, boundary and worker.
///
/// Every event goes to the `log` facade; once `init_audit_logger` has been
/// called events are also appended to a JSON-lines audit file.
use crate::config::types::{BoundaryKind, Generation, Result, SandboxError};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::SystemTime;
use uuid::Uuid;

/// Audit event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditSeverity {
    High,
    Medium,
    Low,
}

/// Types of run events we track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    // Lifecycle events
    RunStart,
    ContextLaunch,
    RunComplete,

    // Failure events
    TransformFailure,
    LaunchFailure,
    ContextExitedEarly,

    // Limit violation events
    WallTimeLimitViolation,

    // Teardown and filtering events
    ContextTeardown,
    StaleEventDropped,
}

impl AuditEventType {
    /// Get the default severity for this event type
    pub fn default_severity(&self) -> AuditSeverity {
        match self {
            AuditEventType::RunStart => AuditSeverity::Low,
            AuditEventType::ContextLaunch => AuditSeverity::Low,
            AuditEventType::RunComplete => AuditSeverity::Low,
            AuditEventType::ContextTeardown => AuditSeverity::Low,
            AuditEventType::StaleEventDropped => AuditSeverity::Low,

            AuditEventType::TransformFailure => AuditSeverity::Medium,
            AuditEventType::WallTimeLimitViolation => AuditSeverity::Medium,

            AuditEventType::LaunchFailure => AuditSeverity::High,
            AuditEventType::ContextExitedEarly => AuditSeverity::High,
        }
    }
}

/// Correlation identifiers for event tracking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationIds {
    /// Unique run identifier, also used as the context instance id
    pub run_id: String,
    pub generation: Generation,
    pub boundary: BoundaryKind,
    /// Worker PID in host namespace, process boundary only
    pub worker_pid: Option<u32>,
}

impl CorrelationIds {
    /// Create new correlation IDs for a run
    pub fn new(generation: Generation, boundary: BoundaryKind) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            generation,
            boundary,
            worker_pid: None,
        }
    }

    /// Set worker PID after spawn
    pub fn with_worker_pid(mut self, pid: Option<u32>) -> Self {
        self.worker_pid = pid;
        self
    }
}

/// Individual audit event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub timestamp: SystemTime,
    pub details: String,
    pub correlation: Option<CorrelationIds>,
}

impl AuditEvent {
    /// Create a new audit event with default severity
    pub fn new(event_type: AuditEventType, details: String) -> Self {
        Self {
            severity: event_type.default_severity(),
            event_type,
            timestamp: SystemTime::now(),
            details,
            correlation: None,
        }
    }

    pub fn with_severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_correlation(mut self, correlation: CorrelationIds) -> Self {
        self.correlation = Some(correlation);
        self
    }

    fn to_json_line(&self) -> serde_json::Value {
        let mut entry = serde_json::json!({
            "timestamp": self.timestamp
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            "event_type": self.event_type,
            "severity": self.severity,
            "details": self.details,
            "process_id": std::process::id(),
        });
        if let Some(correlation) = &self.correlation {
            entry["correlation"] = serde_json::json!({
                "run_id": correlation.run_id,
                "generation": correlation.generation,
                "boundary": correlation.boundary,
                "worker_pid": correlation.worker_pid,
            });
        }
        entry
    }
}

/// Writes audit events to the log facade and an append-only file
pub struct AuditLogger {
    audit_file: Arc<Mutex<File>>,
    audit_path: PathBuf,
}

impl AuditLogger {
    pub fn new(audit_path: PathBuf) -> Result<Self> {
        if let Some(parent) = audit_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                SandboxError::Config(format!("Failed to create audit log directory: {}", e))
            })?;
        }

        let audit_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&audit_path)
            .map_err(|e| SandboxError::Config(format!("Failed to open audit log: {}", e)))?;

        Ok(Self {
            audit_file: Arc::new(Mutex::new(audit_file)),
            audit_path,
        })
    }

    pub fn log_audit_event(&self, event: &AuditEvent) {
        log_to_facade(event);

        let line = event.to_json_line();
        if let Ok(mut file) = self.audit_file.lock() {
            if let Err(e) = writeln!(file, "{}", line) {
                error!("Failed to write to audit log: {}", e);
            }
            if let Err(e) = file.flush() {
                error!("Failed to flush audit log: {}", e);
            }
        } else {
            error!("Failed to acquire lock on audit file");
        }
    }

    pub fn audit_path(&self) -> &Path {
        &self.audit_path
    }
}

fn log_to_facade(event: &AuditEvent) {
    match event.severity {
        AuditSeverity::High => error!("AUDIT {:?}: {}", event.event_type, event.details),
        AuditSeverity::Medium => warn!("AUDIT {:?}: {}", event.event_type, event.details),
        AuditSeverity::Low => info!("AUDIT {:?}: {}", event.event_type, event.details),
    }
}

/// Global audit logger instance
static AUDIT_LOGGER: OnceLock<AuditLogger> = OnceLock::new();

/// Initialize the global audit logger. A second call keeps the first file.
pub fn init_audit_logger(audit_path: PathBuf) -> Result<()> {
    let logger = AuditLogger::new(audit_path)?;
    let path = logger.audit_path().to_path_buf();
    if AUDIT_LOGGER.set(logger).is_err() {
        warn!(
            "Audit logger already initialized; ignoring {}",
            path.display()
        );
    } else {
        info!("Audit logger writing to {}", path.display());
    }
    Ok(())
}

/// Log an audit event using the global logger, or only the log facade
pub fn log_audit_event(event: AuditEvent) {
    match AUDIT_LOGGER.get() {
        Some(logger) => logger.log_audit_event(&event),
        None => log_to_facade(&event),
    }
}

pub fn run_started(correlation: CorrelationIds, source_bytes: usize) {
    let event = AuditEvent::new(
        AuditEventType::RunStart,
        format!(
            "Run started: run_id={}, generation={}, source_bytes={}",
            correlation.run_id, correlation.generation, source_bytes
        ),
    )
    .with_correlation(correlation);

    log_audit_event(event);
}

pub fn transform_failed(correlation: CorrelationIds, message: &str) {
    let event = AuditEvent::new(
        AuditEventType::TransformFailure,
        format!("Transformation failed, no context created: {}", message),
    )
    .with_correlation(correlation);

    log_audit_event(event);
}

pub fn context_launched(correlation: CorrelationIds) {
    let event = AuditEvent::new(
        AuditEventType::ContextLaunch,
        format!(
            "Context launched: boundary={}, worker_pid={:?}",
            correlation.boundary, correlation.worker_pid
        ),
    )
    .with_correlation(correlation);

    log_audit_event(event);
}

pub fn launch_failed(correlation: CorrelationIds, reason: &str) {
    let event = AuditEvent::new(
        AuditEventType::LaunchFailure,
        format!("Context launch failed: {}", reason),
    )
    .with_correlation(correlation);

    log_audit_event(event);
}

pub fn run_completed(correlation: CorrelationIds, elapsed_ms: u64) {
    let event = AuditEvent::new(
        AuditEventType::RunComplete,
        format!("Run completed after {} ms", elapsed_ms),
    )
    .with_correlation(correlation);

    log_audit_event(event);
}

/// Log wall time limit violation
pub fn wall_time_limit_violation(correlation: CorrelationIds, used_ms: u64, limit_ms: u64) {
    let event = AuditEvent::new(
        AuditEventType::WallTimeLimitViolation,
        format!(
            "Wall time limit violated: used={} ms, limit={} ms",
            used_ms, limit_ms
        ),
    )
    .with_correlation(correlation);

    log_audit_event(event);
}

pub fn context_exited_early(correlation: CorrelationIds, reason: Option<&str>) {
    let event = AuditEvent::new(
        AuditEventType::ContextExitedEarly,
        format!(
            "Context closed before completion: {}",
            reason.unwrap_or("no reason given")
        ),
    )
    .with_correlation(correlation);

    log_audit_event(event);
}

pub fn context_torn_down(correlation: CorrelationIds, cause: &str) {
    let event = AuditEvent::new(
        AuditEventType::ContextTeardown,
        format!("Context torn down: {}", cause),
    )
    .with_correlation(correlation);

    log_audit_event(event);
}

pub fn stale_event_dropped(current: Generation, stale: Generation, kind: &str) {
    let event = AuditEvent::new(
        AuditEventType::StaleEventDropped,
        format!(
            "Dropped {} from generation {} (current generation {})",
            kind, stale, current
        ),
    );

    log_audit_event(event);
}
