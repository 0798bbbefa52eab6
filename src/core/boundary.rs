//! Isolation boundaries that host one execution context per run.
//!
//! A [`ContextFactory`] turns a [`LaunchRequest`] into a live context that
//! reports through a channel of [`Envelope`]s and ends with exactly one
//! `Closed` delivery. Teardown is best effort for threads (a thread stuck in
//! user code cannot be preempted and is detached) and definitive for worker
//! processes (the whole process group is killed and reaped).

use crate::config::types::{BoundaryKind, Generation, Result, SandboxConfig, SandboxError};
use crate::core::context::ExecutionContext;
use crate::core::types::{Envelope, LaunchRequest, MessageSink, WorkerMessage};
use crate::core::worker::WORKER_ROLE;
use crossbeam_channel::Sender;
use std::io::{BufRead, BufReader, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Engine recursion is native recursion; give context threads room.
pub const CONTEXT_STACK_SIZE: usize = 16 * 1024 * 1024;

fn to_boundary_error(prefix: &str, err: impl std::fmt::Display) -> SandboxError {
    SandboxError::Boundary(format!("{prefix}: {err}"))
}

/// A live context. Dropping the box without `teardown` is allowed but may leave work running.
pub trait ContextHandle: Send {
    fn generation(&self) -> Generation;

    /// Host PID of the worker, for boundaries that have one
    fn worker_pid(&self) -> Option<u32> {
        None
    }

    fn teardown(self: Box<Self>);
}

pub trait ContextFactory: Send {
    fn kind(&self) -> BoundaryKind;

    fn launch(
        &self,
        request: LaunchRequest,
        outbox: Sender<Envelope>,
    ) -> Result<Box<dyn ContextHandle>>;
}

/// Select the factory the configuration asks for
pub fn factory_for(config: &SandboxConfig) -> Result<Box<dyn ContextFactory>> {
    match config.boundary {
        BoundaryKind::Thread => Ok(Box::new(ThreadBoundary::new())),
        BoundaryKind::Process => {
            let program = match &config.worker_program {
                Some(program) => program.clone(),
                None => std::env::current_exe()
                    .map_err(|e| to_boundary_error("cannot locate worker executable", e))?,
            };
            Ok(Box::new(ProcessBoundary::new(program)))
        }
    }
}

/// Sink that tags every message with its generation and hands it to the host channel.
/// Once the host has torn the context down it refuses further messages.
pub struct ChannelSink {
    generation: Generation,
    outbox: Sender<Envelope>,
    stop: Arc<AtomicBool>,
}

impl ChannelSink {
    pub fn new(generation: Generation, outbox: Sender<Envelope>, stop: Arc<AtomicBool>) -> Self {
        Self {
            generation,
            outbox,
            stop,
        }
    }
}

impl MessageSink for ChannelSink {
    fn post(&mut self, message: WorkerMessage) -> Result<()> {
        if self.stop.load(Ordering::Acquire) {
            return Err(SandboxError::Disconnected);
        }
        self.outbox
            .send(Envelope::message(self.generation, message))
            .map_err(|_| SandboxError::Disconnected)
    }
}

/// One OS thread with its own engine per run
#[derive(Debug, Clone)]
pub struct ThreadBoundary {
    stack_size: usize,
}

impl Default for ThreadBoundary {
    fn default() -> Self {
        Self {
            stack_size: CONTEXT_STACK_SIZE,
        }
    }
}

impl ThreadBoundary {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContextFactory for ThreadBoundary {
    fn kind(&self) -> BoundaryKind {
        BoundaryKind::Thread
    }

    fn launch(
        &self,
        request: LaunchRequest,
        outbox: Sender<Envelope>,
    ) -> Result<Box<dyn ContextHandle>> {
        let generation = request.generation;
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let thread = thread::Builder::new()
            .name(format!("scriptbox-ctx-{generation}"))
            .stack_size(self.stack_size)
            .spawn(move || run_context_thread(request, outbox, thread_stop))
            .map_err(|e| to_boundary_error("failed to spawn context thread", e))?;

        Ok(Box::new(ThreadHandle {
            generation,
            stop,
            thread: Some(thread),
        }))
    }
}

fn run_context_thread(request: LaunchRequest, outbox: Sender<Envelope>, stop: Arc<AtomicBool>) {
    let generation = request.generation;
    let sink = ChannelSink::new(generation, outbox.clone(), Arc::clone(&stop));

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        ExecutionContext::new(Box::new(sink), Arc::clone(&stop))?.run(&request.executable)
    }));

    let reason = match outcome {
        Ok(Ok(())) | Ok(Err(SandboxError::Disconnected)) => None,
        Ok(Err(e)) => {
            log::warn!("context {} failed: {}", request.instance_id, e);
            Some(e.to_string())
        }
        Err(_) => {
            log::error!("context {} panicked", request.instance_id);
            Some("execution context panicked".to_string())
        }
    };

    // A torn-down context has no listener left.
    if stop.load(Ordering::Acquire) {
        return;
    }
    let _ = outbox.send(Envelope::closed(generation, reason));
}

struct ThreadHandle {
    generation: Generation,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ContextHandle for ThreadHandle {
    fn generation(&self) -> Generation {
        self.generation
    }

    fn teardown(mut self: Box<Self>) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.is_finished() {
                let _ = thread.join();
            } else {
                log::debug!(
                    "detaching context thread of generation {}; it stops at its next yield point",
                    self.generation
                );
            }
        }
    }
}

/// Worker subprocess per run, in its own process group
#[derive(Debug, Clone)]
pub struct ProcessBoundary {
    program: PathBuf,
}

impl ProcessBoundary {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ContextFactory for ProcessBoundary {
    fn kind(&self) -> BoundaryKind {
        BoundaryKind::Process
    }

    fn launch(
        &self,
        request: LaunchRequest,
        outbox: Sender<Envelope>,
    ) -> Result<Box<dyn ContextHandle>> {
        let payload = serde_json::to_vec(&request)
            .map_err(|e| SandboxError::Protocol(format!("failed to encode launch request: {e}")))?;

        let mut command = Command::new(&self.program);
        command
            .arg("--internal-role")
            .arg(WORKER_ROLE)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let child = command.spawn().map_err(|e| {
            to_boundary_error(
                &format!("failed to spawn worker {}", self.program.display()),
                e,
            )
        })?;

        let mut handle = ProcessHandle {
            generation: request.generation,
            child,
            reaped: false,
        };
        let streams = (
            handle.child.stdin.take(),
            handle.child.stdout.take(),
            handle.child.stderr.take(),
        );
        let (Some(mut stdin), Some(stdout), Some(stderr)) = streams else {
            return Err(SandboxError::Boundary(
                "worker stdio pipes unavailable".to_string(),
            ));
        };

        stdin
            .write_all(&payload)
            .and_then(|()| stdin.flush())
            .map_err(|e| to_boundary_error("failed to send launch request", e))?;
        drop(stdin);

        let generation = request.generation;
        thread::Builder::new()
            .name(format!("scriptbox-worker-out-{generation}"))
            .spawn(move || forward_worker_messages(generation, stdout, outbox))
            .map_err(|e| to_boundary_error("failed to spawn worker reader", e))?;
        thread::Builder::new()
            .name(format!("scriptbox-worker-err-{generation}"))
            .spawn(move || forward_worker_stderr(generation, stderr))
            .map_err(|e| to_boundary_error("failed to spawn worker stderr reader", e))?;

        log::debug!(
            "launched worker pid {} for generation {}",
            handle.child.id(),
            generation
        );
        Ok(Box::new(handle))
    }
}

/// Worker stdout carries one JSON [`WorkerMessage`] per line.
fn forward_worker_messages(generation: Generation, stdout: ChildStdout, outbox: Sender<Envelope>) {
    let mut reason = None;
    for line in BufReader::new(stdout).lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                reason = Some(format!("failed to read worker output: {e}"));
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<WorkerMessage>(&line) {
            Ok(message) => {
                if outbox.send(Envelope::message(generation, message)).is_err() {
                    return;
                }
            }
            Err(e) => log::warn!("generation {generation}: dropping malformed worker line: {e}"),
        }
    }
    let _ = outbox.send(Envelope::closed(generation, reason));
}

fn forward_worker_stderr(generation: Generation, stderr: ChildStderr) {
    for line in BufReader::new(stderr).lines().map_while(std::result::Result::ok) {
        log::debug!("worker[{generation}] {line}");
    }
}

struct ProcessHandle {
    generation: Generation,
    child: Child,
    reaped: bool,
}

impl ProcessHandle {
    fn terminate(&mut self) {
        if self.reaped {
            return;
        }

        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            match killpg(Pid::from_raw(self.child.id() as i32), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => {
                    log::warn!("killpg({}) failed: {}; killing worker only", self.child.id(), e);
                    let _ = self.child.kill();
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.kill();
        }

        match self.child.wait() {
            Ok(status) => log::debug!(
                "worker of generation {} reaped: {}",
                self.generation,
                status
            ),
            Err(e) => log::warn!(
                "failed to reap worker of generation {}: {}",
                self.generation,
                e
            ),
        }
        self.reaped = true;
    }
}

impl ContextHandle for ProcessHandle {
    fn generation(&self) -> Generation {
        self.generation
    }

    fn worker_pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn teardown(mut self: Box<Self>) {
        self.terminate();
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Delivery;
    use crate::transform::Transformer;
    use crossbeam_channel::{unbounded, Receiver};
    use std::time::Duration;

    fn request(generation: Generation, source: &str) -> LaunchRequest {
        LaunchRequest {
            instance_id: format!("test-{generation}"),
            generation,
            executable: Transformer::new().transform(source).unwrap(),
        }
    }

    fn collect_until_closed(rx: &Receiver<Envelope>) -> Vec<Envelope> {
        let mut envelopes = Vec::new();
        loop {
            let envelope = rx
                .recv_timeout(Duration::from_secs(10))
                .expect("context never closed");
            let closed = matches!(envelope.delivery, Delivery::Closed { .. });
            envelopes.push(envelope);
            if closed {
                return envelopes;
            }
        }
    }

    #[test]
    fn test_channel_sink_reports_disconnect() {
        let (tx, rx) = unbounded();
        let mut sink = ChannelSink::new(3, tx, Arc::new(AtomicBool::new(false)));
        sink.post(WorkerMessage::Complete).unwrap();
        assert_eq!(
            rx.recv().unwrap(),
            Envelope::message(3, WorkerMessage::Complete)
        );
        drop(rx);
        assert!(matches!(
            sink.post(WorkerMessage::Complete),
            Err(SandboxError::Disconnected)
        ));
    }

    #[test]
    fn test_channel_sink_refuses_after_stop() {
        let (tx, rx) = unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let mut sink = ChannelSink::new(1, tx, Arc::clone(&stop));
        stop.store(true, Ordering::Release);
        assert!(matches!(
            sink.post(WorkerMessage::Complete),
            Err(SandboxError::Disconnected)
        ));
        assert!(rx.is_empty());
    }

    #[test]
    fn test_thread_boundary_tags_generation_and_closes() {
        let (tx, rx) = unbounded();
        let handle = ThreadBoundary::new()
            .launch(request(7, "console.log('hi')"), tx)
            .unwrap();
        assert_eq!(handle.generation(), 7);
        assert_eq!(handle.worker_pid(), None);

        let envelopes = collect_until_closed(&rx);
        assert!(envelopes.iter().all(|e| e.generation == 7));
        assert_eq!(envelopes.len(), 3);
        assert_eq!(envelopes[1].delivery, Delivery::Message(WorkerMessage::Complete));
        assert_eq!(envelopes[2].delivery, Delivery::Closed { reason: None });
        handle.teardown();
    }

    #[test]
    fn test_thread_teardown_stops_lingering_timers() {
        let (tx, rx) = unbounded();
        let handle = ThreadBoundary::new()
            .launch(request(1, "setInterval(() => {}, 5);"), tx)
            .unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(10)).unwrap().delivery,
            Delivery::Message(WorkerMessage::Complete)
        );
        handle.teardown();
        // The thread exits without another word and drops its senders.
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(10)),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected)
        );
    }

    #[test]
    fn test_thread_teardown_unwinds_console_loop() {
        let (tx, rx) = unbounded();
        let handle = ThreadBoundary::new()
            .launch(request(1, "while (true) { console.log('x'); }"), tx)
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(10)).is_ok());
        handle.teardown();

        let mut queued = 0;
        loop {
            match rx.recv_timeout(Duration::from_secs(10)) {
                Ok(_) => queued += 1,
                Err(e) => {
                    assert_eq!(e, crossbeam_channel::RecvTimeoutError::Disconnected);
                    break;
                }
            }
            assert!(queued < 1_000_000, "context kept posting after teardown");
        }
    }

    #[test]
    fn test_process_boundary_missing_program() {
        let (tx, _rx) = unbounded();
        let result = ProcessBoundary::new("/nonexistent/scriptbox-worker").launch(request(1, "1"), tx);
        assert!(matches!(result, Err(SandboxError::Boundary(_))));
    }

    #[test]
    fn test_factory_for_selects_boundary() {
        let config = SandboxConfig::default();
        assert_eq!(factory_for(&config).unwrap().kind(), BoundaryKind::Thread);
        let config = config
            .with_boundary(BoundaryKind::Process)
            .with_worker_program("/bin/true");
        assert_eq!(factory_for(&config).unwrap().kind(), BoundaryKind::Process);
    }

    #[cfg(unix)]
    fn fake_worker(dir: &std::path::Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-worker.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn test_process_boundary_parses_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_worker(
            dir.path(),
            r#"cat > /dev/null
echo '{"type":"console","method":"log","args":["from worker"]}'
echo 'not json'
echo '{"type":"complete"}'"#,
        );

        let (tx, rx) = unbounded();
        let handle = ProcessBoundary::new(program).launch(request(4, "1"), tx).unwrap();
        assert!(handle.worker_pid().is_some());

        let envelopes = collect_until_closed(&rx);
        let deliveries: Vec<_> = envelopes.into_iter().map(|e| e.delivery).collect();
        assert_eq!(
            deliveries,
            vec![
                Delivery::Message(WorkerMessage::Console {
                    method: crate::config::types::ConsoleMethod::Log,
                    args: vec!["from worker".to_string()],
                }),
                Delivery::Message(WorkerMessage::Complete),
                Delivery::Closed { reason: None },
            ]
        );
        handle.teardown();
    }

    #[cfg(unix)]
    #[test]
    fn test_process_teardown_kills_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_worker(dir.path(), "cat > /dev/null\nsleep 30\necho never");

        let (tx, rx) = unbounded();
        let handle = ProcessBoundary::new(program).launch(request(2, "1"), tx).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        handle.teardown();

        let closed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(closed.delivery, Delivery::Closed { reason: None });
    }
}
