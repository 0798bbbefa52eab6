use crate::config::types::{ConsoleMethod, Generation, Result, RunOutcome, Severity};
use crate::transform::ExecutableText;
use serde::{Deserialize, Serialize};

/// Executor->host wire message. These are the only things that cross the boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerMessage {
    Console {
        method: ConsoleMethod,
        args: Vec<String>,
    },
    Complete,
}

/// Host->executor launch contract.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub instance_id: String,
    pub generation: Generation,
    pub executable: ExecutableText,
}

/// What arrived from a context, tagged with the generation it was launched for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub generation: Generation,
    pub delivery: Delivery,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    Message(WorkerMessage),
    /// The context's outbound channel ended, with an optional failure reason
    Closed { reason: Option<String> },
}

impl Envelope {
    pub fn message(generation: Generation, message: WorkerMessage) -> Self {
        Self {
            generation,
            delivery: Delivery::Message(message),
        }
    }

    pub fn closed(generation: Generation, reason: Option<String>) -> Self {
        Self {
            generation,
            delivery: Delivery::Closed { reason },
        }
    }
}

/// Outbound side of an execution context
pub trait MessageSink {
    fn post(&mut self, message: WorkerMessage) -> Result<()>;
}

impl MessageSink for Vec<WorkerMessage> {
    fn post(&mut self, message: WorkerMessage) -> Result<()> {
        self.push(message);
        Ok(())
    }
}

/// One line of captured output
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub severity: Severity,
    pub text: String,
}

impl OutputEvent {
    pub fn new(severity: Severity, text: impl Into<String>) -> Self {
        Self {
            severity,
            text: text.into(),
        }
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self::new(Severity::Info, text)
    }

    pub fn warn(text: impl Into<String>) -> Self {
        Self::new(Severity::Warn, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(Severity::Error, text)
    }

    /// One console call becomes one event; arguments are joined by a space.
    pub fn from_console(method: ConsoleMethod, args: &[String]) -> Self {
        Self::new(method.severity(), args.join(" "))
    }

    /// Text as the display surface shows it, with the severity marker.
    pub fn display_line(&self) -> String {
        match self.severity.marker() {
            Some(marker) if !self.text.starts_with(marker) => format!("{marker} {}", self.text),
            _ => self.text.clone(),
        }
    }
}

/// Core->host event stream item
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HostEvent {
    Output(OutputEvent),
    Terminal { result: RunOutcome },
}

impl HostEvent {
    pub fn as_output(&self) -> Option<&OutputEvent> {
        match self {
            HostEvent::Output(event) => Some(event),
            HostEvent::Terminal { .. } => None,
        }
    }

    pub fn outcome(&self) -> Option<RunOutcome> {
        match self {
            HostEvent::Terminal { result } => Some(*result),
            HostEvent::Output(_) => None,
        }
    }
}

/// Everything the host observed for one run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub generation: Generation,
    pub events: Vec<HostEvent>,
    pub outcome: RunOutcome,
    pub wall_time_ms: u64,
}

impl RunReport {
    pub fn outputs(&self) -> impl Iterator<Item = &OutputEvent> {
        self.events.iter().filter_map(HostEvent::as_output)
    }

    /// Raw texts in emission order
    pub fn texts(&self) -> Vec<&str> {
        self.outputs().map(|event| event.text.as_str()).collect()
    }

    pub fn terminal_count(&self) -> usize {
        self.events
            .iter()
            .filter(|event| event.outcome().is_some())
            .count()
    }
}
