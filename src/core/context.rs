//! One disposable execution context.
//!
//! Run order: top-level code, first microtask checkpoint (with its
//! unhandled-rejection report), `complete`, then the timer loop until no
//! timers remain, the host asks to stop, or the outbound sink is gone.
//! Everything user code does wrong becomes an `error` console message; the
//! context itself only fails when the engine cannot be built.

use crate::config::types::{ConsoleMethod, Result, SandboxError};
use crate::core::harness::{self, with_harness, HarnessGuard, HarnessState};
use crate::core::timers::TimerPoll;
use crate::core::types::{MessageSink, WorkerMessage};
use crate::transform::ExecutableText;
use boa_engine::builtins::promise::PromiseState;
use boa_engine::object::builtins::JsPromise;
use boa_engine::{Context, JsError, JsObject, JsValue, Source};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Longest sleep between stop-flag checks while waiting for a timer
pub const IDLE_SLICE: Duration = Duration::from_millis(25);

pub const FAILURE_MARKER: &str = "❌";
pub const UNHANDLED_REJECTION_LABEL: &str = "Unhandled Promise Rejection:";
/// Name shown for recursion and stack limit errors
const RUNTIME_LIMIT_ERROR_NAME: &str = "RangeError";

pub struct ExecutionContext {
    // Declaration order is drop order: harness roots go before the engine.
    _harness: HarnessGuard,
    renderer: JsObject,
    context: Context,
    stop: Arc<AtomicBool>,
}

impl ExecutionContext {
    /// Builds a fresh engine with the harness installed on the current thread.
    pub fn new(sink: Box<dyn MessageSink>, stop: Arc<AtomicBool>) -> Result<Self> {
        let guard = HarnessGuard::install(sink)?;
        let mut context = harness::build_context()?;
        let renderer = harness::install(&mut context)?;
        Ok(Self {
            _harness: guard,
            renderer,
            context,
            stop,
        })
    }

    /// Runs the executable to its natural end or until stopped. Consumes the context.
    pub fn run(mut self, executable: &ExecutableText) -> Result<()> {
        let started = Instant::now();

        if let Err(err) = self.context.eval(Source::from_bytes(executable.as_str())) {
            self.report_uncaught(err);
        }
        self.checkpoint();
        self.post(WorkerMessage::Complete);
        log::debug!("top-level code finished in {:?}", started.elapsed());

        self.event_loop();

        if with_harness(|h| h.is_disconnected()).unwrap_or(true) {
            return Err(SandboxError::Disconnected);
        }
        Ok(())
    }

    fn event_loop(&mut self) {
        while !self.should_stop() {
            match with_harness(|h| h.timers.poll(Instant::now())) {
                None | Some(TimerPoll::Idle) => break,
                Some(TimerPoll::Wait(remaining)) => thread::sleep(remaining.min(IDLE_SLICE)),
                Some(TimerPoll::Fire(fired)) => {
                    let task = &fired.payload;
                    let result =
                        task.callback
                            .call(&JsValue::undefined(), &task.args, &mut self.context);
                    if let Err(err) = result {
                        self.report_uncaught(err);
                    }
                    with_harness(|h| h.timers.finish(fired, Instant::now()));
                    self.checkpoint();
                }
            }
        }
    }

    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire) || with_harness(|h| h.is_disconnected()).unwrap_or(true)
    }

    /// Drains microtasks, then reports rejections nobody handled meanwhile.
    fn checkpoint(&mut self) {
        self.context.run_jobs();

        let rejected = with_harness(HarnessState::take_pending_rejections).unwrap_or_default();
        for promise in rejected {
            let Ok(promise) = JsPromise::from_object(promise) else {
                continue;
            };
            if let PromiseState::Rejected(reason) = promise.state() {
                let text = self.render(&reason);
                self.post_error(format!("{UNHANDLED_REJECTION_LABEL} {text}"));
            }
        }
    }

    fn report_uncaught(&mut self, err: JsError) {
        // Runtime limit errors have no script-visible form; to_opaque panics on them.
        let text = match err.as_native() {
            Some(native) if native.is_runtime_limit() => {
                format!("{RUNTIME_LIMIT_ERROR_NAME}: {}", native.message())
            }
            _ => {
                let value = err.to_opaque(&mut self.context);
                self.render(&value)
            }
        };
        self.post_error(text);
    }

    fn render(&mut self, value: &JsValue) -> String {
        match self.renderer.call(
            &JsValue::undefined(),
            std::slice::from_ref(value),
            &mut self.context,
        ) {
            Ok(rendered) => match rendered.as_string() {
                Some(text) => text.to_std_string_escaped(),
                None => rendered.display().to_string(),
            },
            Err(_) => value.display().to_string(),
        }
    }

    fn post_error(&mut self, text: String) {
        self.post(WorkerMessage::Console {
            method: ConsoleMethod::Error,
            args: vec![format!("{FAILURE_MARKER} {text}")],
        });
    }

    fn post(&mut self, message: WorkerMessage) {
        with_harness(|h| h.post(message));
    }
}
