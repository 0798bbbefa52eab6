use crate::config::types::{
    Generation, LateOutputPolicy, Result, RunOutcome, SandboxConfig, SandboxError,
};
use crate::config::validator::validate_config;
use crate::core::boundary::{factory_for, ContextFactory, ContextHandle};
use crate::core::types::{
    Delivery, Envelope, HostEvent, LaunchRequest, OutputEvent, RunReport, WorkerMessage,
};
use crate::observability::audit::{self, CorrelationIds};
use crate::transform::Transformer;
use crate::utils::output::OutputLog;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Poll slice used by [`Sandbox::run_to_completion`]
const COMPLETION_POLL: Duration = Duration::from_millis(50);

/// Bookkeeping for the current generation
struct ActiveRun {
    generation: Generation,
    correlation: CorrelationIds,
    handle: Option<Box<dyn ContextHandle>>,
    started: Instant,
    deadline: Instant,
    terminal: Option<RunOutcome>,
}

impl ActiveRun {
    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Host side of the sandbox.
///
/// Owns the generation counter, the display log and at most one live
/// execution context. Contexts talk back only through the inbox channel;
/// every envelope is checked against the current generation before it can
/// touch the log.
pub struct Sandbox {
    config: SandboxConfig,
    transformer: Transformer,
    factory: Box<dyn ContextFactory>,
    inbox_tx: Sender<Envelope>,
    inbox_rx: Receiver<Envelope>,
    generation: Generation,
    active: Option<ActiveRun>,
    pending: VecDeque<HostEvent>,
    log: OutputLog,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Result<Self> {
        let factory = factory_for(&config)?;
        Self::with_factory(config, factory)
    }

    pub fn with_factory(config: SandboxConfig, factory: Box<dyn ContextFactory>) -> Result<Self> {
        validate_config(&config)?;
        if let Some(path) = &config.audit_log {
            audit::init_audit_logger(path.clone())?;
        }
        if factory.kind() != config.boundary {
            log::debug!(
                "factory boundary {} overrides configured {}",
                factory.kind(),
                config.boundary
            );
        }

        let (inbox_tx, inbox_rx) = unbounded();
        Ok(Self {
            log: OutputLog::new(config.output_limits),
            config,
            transformer: Transformer::new(),
            factory,
            inbox_tx,
            inbox_rx,
            generation: 0,
            active: None,
            pending: VecDeque::new(),
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn output(&self) -> &OutputLog {
        &self.log
    }

    /// A run whose terminal signal has not been observed yet
    pub fn is_running(&self) -> bool {
        self.active.as_ref().is_some_and(|run| run.terminal.is_none())
    }

    /// A context (possibly finished with `completed`) is still attached
    pub fn is_context_alive(&self) -> bool {
        self.active.as_ref().is_some_and(|run| run.handle.is_some())
    }

    /// Starts a new run. Events arrive through [`Sandbox::poll`].
    pub fn run(&mut self, source: &str) -> Result<Generation> {
        if let Some(run) = self.active.as_ref().filter(|run| run.terminal.is_none()) {
            return Err(SandboxError::RunInProgress(run.generation));
        }

        self.retire_active("superseded by a new run");
        self.generation += 1;
        self.pending.clear();
        self.log.clear();

        let generation = self.generation;
        let correlation = CorrelationIds::new(generation, self.factory.kind());
        audit::run_started(correlation.clone(), source.len());

        let started = Instant::now();
        let executable = match self.transformer.transform(source) {
            Ok(executable) => executable,
            Err(err) => {
                audit::transform_failed(correlation.clone(), &err.message);
                self.pending.push_back(HostEvent::Output(OutputEvent::error(format!(
                    "❌ {}",
                    SandboxError::from(err)
                ))));
                self.pending.push_back(HostEvent::Terminal {
                    result: RunOutcome::Completed,
                });
                self.active = Some(ActiveRun {
                    generation,
                    correlation,
                    handle: None,
                    started,
                    deadline: started,
                    terminal: Some(RunOutcome::Completed),
                });
                return Ok(generation);
            }
        };

        let request = LaunchRequest {
            instance_id: correlation.run_id.clone(),
            generation,
            executable,
        };
        let handle = match self.factory.launch(request, self.inbox_tx.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                audit::launch_failed(correlation, &e.to_string());
                return Err(e);
            }
        };

        let correlation = correlation.with_worker_pid(handle.worker_pid());
        audit::context_launched(correlation.clone());

        // The budget starts when the context exists.
        let started = Instant::now();
        self.active = Some(ActiveRun {
            generation,
            correlation,
            handle: Some(handle),
            started,
            deadline: started + self.config.timeout,
            terminal: None,
        });
        Ok(generation)
    }

    /// Abandons the current run without a terminal signal and clears the log.
    pub fn reset(&mut self) {
        self.retire_active("reset");
        self.active = None;
        self.generation += 1;
        self.pending.clear();
        self.log.clear();
    }

    pub fn clear_output(&mut self) {
        self.log.clear();
    }

    /// Next event for the current generation, waiting at most `wait`.
    pub fn poll(&mut self, wait: Duration) -> Option<HostEvent> {
        let give_up = Instant::now() + wait;
        loop {
            if let Some(event) = self.pending.pop_front() {
                if let HostEvent::Output(output) = &event {
                    self.log.push(output);
                }
                return Some(event);
            }

            self.enforce_deadline();
            if !self.pending.is_empty() {
                continue;
            }

            let now = Instant::now();
            let mut until = give_up;
            if let Some(deadline) = self.live_deadline() {
                until = until.min(deadline);
            }

            match self.inbox_rx.recv_timeout(until.saturating_duration_since(now)) {
                Ok(envelope) => self.accept(envelope),
                Err(RecvTimeoutError::Timeout) => {
                    if Instant::now() >= give_up && self.live_deadline_passed().is_none() {
                        return None;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Runs `source` and collects its events until the context has finished.
    pub fn run_to_completion(&mut self, source: &str) -> Result<RunReport> {
        let generation = self.run(source)?;
        let started = Instant::now();
        let mut events = Vec::new();
        let mut outcome = None;

        loop {
            if let Some(event) = self.poll(COMPLETION_POLL) {
                if let Some(result) = event.outcome() {
                    outcome = Some(result);
                }
                events.push(event);
                continue;
            }
            if outcome.is_some() && !self.is_context_alive() && self.pending.is_empty() {
                break;
            }
        }

        Ok(RunReport {
            generation,
            events,
            outcome: outcome.unwrap_or(RunOutcome::Completed),
            wall_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn live_deadline(&self) -> Option<Instant> {
        self.active
            .as_ref()
            .filter(|run| run.handle.is_some())
            .map(|run| run.deadline)
    }

    fn live_deadline_passed(&self) -> Option<Instant> {
        self.live_deadline().filter(|deadline| Instant::now() >= *deadline)
    }

    /// Timeout handling: synthesize the terminal if none arrived, then tear down.
    fn enforce_deadline(&mut self) {
        if self.live_deadline_passed().is_none() {
            return;
        }
        let timeout_label = self.config.timeout_label();
        let limit_ms = self.config.timeout.as_millis() as u64;
        let Some(run) = self.active.as_mut() else {
            return;
        };

        if run.terminal.is_none() {
            run.terminal = Some(RunOutcome::TimedOut);
            audit::wall_time_limit_violation(run.correlation.clone(), run.elapsed_ms(), limit_ms);
            self.pending.push_back(HostEvent::Output(OutputEvent::warn(format!(
                "⚠️ Execution timeout ({timeout_label})"
            ))));
            self.pending.push_back(HostEvent::Terminal {
                result: RunOutcome::TimedOut,
            });
            self.retire_active("wall time limit");
        } else {
            self.retire_active("lingering work cut off at deadline");
        }
    }

    fn accept(&mut self, envelope: Envelope) {
        let late_output = self.config.late_output;
        let current = self.generation;
        let Some(run) = self
            .active
            .as_mut()
            .filter(|run| run.generation == envelope.generation && run.handle.is_some())
        else {
            let kind = match &envelope.delivery {
                Delivery::Message(WorkerMessage::Console { .. }) => "console message",
                Delivery::Message(WorkerMessage::Complete) => "completion",
                Delivery::Closed { .. } => "close notice",
            };
            audit::stale_event_dropped(current, envelope.generation, kind);
            return;
        };

        match envelope.delivery {
            Delivery::Message(WorkerMessage::Console { method, args }) => {
                if run.terminal.is_some() && late_output == LateOutputPolicy::Drop {
                    log::debug!("dropping post-completion output of generation {}", run.generation);
                    return;
                }
                self.pending
                    .push_back(HostEvent::Output(OutputEvent::from_console(method, &args)));
            }
            Delivery::Message(WorkerMessage::Complete) => {
                if run.terminal.is_some() {
                    log::warn!("duplicate completion from generation {}", run.generation);
                    return;
                }
                run.terminal = Some(RunOutcome::Completed);
                audit::run_completed(run.correlation.clone(), run.elapsed_ms());
                self.pending.push_back(HostEvent::Terminal {
                    result: RunOutcome::Completed,
                });
            }
            Delivery::Closed { reason } => {
                if run.terminal.is_none() {
                    run.terminal = Some(RunOutcome::Completed);
                    audit::context_exited_early(run.correlation.clone(), reason.as_deref());
                    let text = match &reason {
                        Some(reason) => {
                            format!("❌ Execution context exited before completion: {reason}")
                        }
                        None => "❌ Execution context exited before completion".to_string(),
                    };
                    self.pending.push_back(HostEvent::Output(OutputEvent::error(text)));
                    self.pending.push_back(HostEvent::Terminal {
                        result: RunOutcome::Completed,
                    });
                }
                self.retire_active("context finished");
            }
        }
    }

    /// Tears down the attached context, if any. The run record stays.
    fn retire_active(&mut self, cause: &str) {
        let Some(run) = self.active.as_mut() else {
            return;
        };
        if let Some(handle) = run.handle.take() {
            audit::context_torn_down(run.correlation.clone(), cause);
            handle.teardown();
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.retire_active("sandbox dropped");
    }
}
