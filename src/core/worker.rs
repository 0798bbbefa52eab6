//! Executor side of the process boundary.
//!
//! The host re-executes its own binary with `--internal-role worker`, writes
//! one JSON [`LaunchRequest`] to the worker's stdin and closes it. The worker
//! answers with one JSON [`WorkerMessage`] per stdout line and exits when its
//! context has nothing left to do. Nothing else may be written to stdout.

use crate::config::types::{Result, SandboxError};
use crate::core::context::ExecutionContext;
use crate::core::types::{LaunchRequest, MessageSink, WorkerMessage};
use serde::de::DeserializeOwned;
use std::io::{self, Read, Write};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Value of the hidden `--internal-role` flag
pub const WORKER_ROLE: &str = "worker";

fn to_protocol_error(prefix: &str, err: impl std::fmt::Display) -> SandboxError {
    SandboxError::Protocol(format!("{prefix}: {err}"))
}

fn read_json<T: DeserializeOwned>(mut reader: impl Read) -> Result<T> {
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    serde_json::from_slice(&data).map_err(|e| to_protocol_error("failed to decode launch request", e))
}

/// Writes each message as one JSON line and flushes it immediately.
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> MessageSink for JsonLinesSink<W> {
    fn post(&mut self, message: WorkerMessage) -> Result<()> {
        let mut line = serde_json::to_vec(&message)
            .map_err(|e| to_protocol_error("failed to encode worker message", e))?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .and_then(|()| self.writer.flush())
            .map_err(|e| match e.kind() {
                io::ErrorKind::BrokenPipe => SandboxError::Disconnected,
                _ => SandboxError::Io(e),
            })
    }
}

/// Entry point of the worker role
pub fn run_worker_main() -> Result<()> {
    let request: LaunchRequest = read_json(io::stdin().lock())?;
    log::debug!(
        "worker {} starting generation {}",
        request.instance_id,
        request.generation
    );

    let sink = JsonLinesSink::new(io::stdout());
    let stop = Arc::new(AtomicBool::new(false));
    match ExecutionContext::new(Box::new(sink), stop)?.run(&request.executable) {
        Ok(()) | Err(SandboxError::Disconnected) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ConsoleMethod;
    use crate::transform::Transformer;

    #[test]
    fn test_json_lines_sink_writes_one_line_per_message() {
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.post(WorkerMessage::Console {
            method: ConsoleMethod::Error,
            args: vec!["multi\nline".to_string()],
        })
        .unwrap();
        sink.post(WorkerMessage::Complete).unwrap();

        let output = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            r#"{"type":"console","method":"error","args":["multi\nline"]}"#
        );
        assert_eq!(lines[1], r#"{"type":"complete"}"#);
    }

    #[test]
    fn test_launch_request_round_trip() {
        let request = LaunchRequest {
            instance_id: "abc".to_string(),
            generation: 9,
            executable: Transformer::new().transform("console.log(1)").unwrap(),
        };
        let encoded = serde_json::to_vec(&request).unwrap();
        let decoded: LaunchRequest = read_json(encoded.as_slice()).unwrap();
        assert_eq!(decoded.generation, 9);
        assert_eq!(decoded.executable, request.executable);
    }

    #[test]
    fn test_garbage_request_is_protocol_error() {
        let result: Result<LaunchRequest> = read_json("not json".as_bytes());
        assert!(matches!(result, Err(SandboxError::Protocol(_))));
    }
}
