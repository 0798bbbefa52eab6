//! Instrumentation installed into every execution context before user code.
//!
//! The engine has no console, no timers and no host page to report rejected
//! promises to, so the harness supplies them. Native functions reach the
//! per-thread [`HarnessState`] that owns the outbound sink, the timer queue and
//! the list of rejected-but-unhandled promises. A small script prelude then
//! wraps the native bridge into `console.*`, removes the bridge from the
//! global object and hands back the value renderer used for error reports.

use crate::config::types::{ConsoleMethod, Result, SandboxError};
use crate::core::timers::{clamp_delay, TimerQueue};
use crate::core::types::{MessageSink, WorkerMessage};
use boa_engine::builtins::promise::OperationType;
use boa_engine::context::HostHooks;
use boa_engine::{
    js_string, Context, JsError, JsNativeError, JsObject, JsResult, JsValue, NativeFunction,
    Source,
};
use std::cell::RefCell;
use std::time::Instant;

/// Global the prelude consumes and deletes
pub const BRIDGE_NAME: &str = "__scriptbox_post";

const PRELUDE: &str = r#"(function (global, post) {
  'use strict';
  // Intrinsics are captured now; user code may replace them later.
  var reflectApply = Reflect.apply;
  var stringify = JSON.stringify;
  var toText = String;
  var objectToString = Object.prototype.toString;
  var ErrorType = Error;

  function render(value) {
    if (value instanceof ErrorType) {
      var head = toText(value);
      var stack = value.stack;
      if (typeof stack === 'string' && stack.length > 0) {
        return stack.indexOf(head) === -1 ? head + '\n' + stack : stack;
      }
      return head;
    }
    if (value !== null && typeof value === 'object') {
      try {
        var json = stringify(value, null, 2);
        if (typeof json === 'string') {
          return json;
        }
      } catch (e) {}
    }
    return toText(value);
  }

  function safeRender(value) {
    try {
      return render(value);
    } catch (e) {
      try {
        return reflectApply(objectToString, value, []);
      } catch (_) {
        return '[unrenderable value]';
      }
    }
  }

  function consoleMethod(method) {
    return function () {
      var args = [method];
      for (var i = 0; i < arguments.length; i++) {
        args[i + 1] = safeRender(arguments[i]);
      }
      reflectApply(post, undefined, args);
    };
  }

  var sandboxConsole = {};
  var methods = ['log', 'info', 'debug', 'warn', 'error'];
  for (var m = 0; m < methods.length; m++) {
    sandboxConsole[methods[m]] = consoleMethod(methods[m]);
  }

  Object.defineProperty(global, 'console', {
    value: sandboxConsole,
    writable: true,
    enumerable: false,
    configurable: true
  });
  delete global.__scriptbox_post;
  return safeRender;
})(globalThis, globalThis.__scriptbox_post);
"#;

/// Callback plus extra arguments of one scheduled timer
pub(crate) struct TimerTask {
    pub callback: JsObject,
    pub args: Vec<JsValue>,
}

pub(crate) struct HarnessState {
    sink: Box<dyn MessageSink>,
    pub timers: TimerQueue<TimerTask>,
    pending_rejections: Vec<JsObject>,
    disconnected: bool,
}

impl HarnessState {
    /// Posts a message; a failing sink marks the harness disconnected for good.
    pub fn post(&mut self, message: WorkerMessage) {
        if self.disconnected {
            return;
        }
        if let Err(e) = self.sink.post(message) {
            log::debug!("harness sink closed: {}", e);
            self.disconnected = true;
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn take_pending_rejections(&mut self) -> Vec<JsObject> {
        std::mem::take(&mut self.pending_rejections)
    }
}

thread_local! {
    static HARNESS: RefCell<Option<HarnessState>> = const { RefCell::new(None) };
}

/// Runs `f` against this thread's harness, if one is installed.
pub(crate) fn with_harness<R>(f: impl FnOnce(&mut HarnessState) -> R) -> Option<R> {
    HARNESS.with(|cell| cell.borrow_mut().as_mut().map(f))
}

/// Keeps the harness installed for the lifetime of one execution context.
pub(crate) struct HarnessGuard {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl HarnessGuard {
    pub fn install(sink: Box<dyn MessageSink>) -> Result<Self> {
        HARNESS.with(|cell| {
            let mut slot = cell.borrow_mut();
            if slot.is_some() {
                return Err(SandboxError::Engine(
                    "an execution context is already active on this thread".to_string(),
                ));
            }
            *slot = Some(HarnessState {
                sink,
                timers: TimerQueue::new(),
                pending_rejections: Vec::new(),
                disconnected: false,
            });
            Ok(Self {
                _not_send: std::marker::PhantomData,
            })
        })
    }
}

impl Drop for HarnessGuard {
    fn drop(&mut self) {
        let state = HARNESS.with(|cell| cell.borrow_mut().take());
        drop(state);
    }
}

/// Host hook feeding promise rejection bookkeeping into the harness
struct RejectionTracker;

impl HostHooks for RejectionTracker {
    fn promise_rejection_tracker(
        &self,
        promise: &JsObject,
        operation: OperationType,
        _context: &mut Context,
    ) {
        with_harness(|harness| match operation {
            OperationType::Reject => harness.pending_rejections.push(promise.clone()),
            OperationType::Handle => harness
                .pending_rejections
                .retain(|pending| !JsObject::equals(pending, promise)),
        });
    }
}

static REJECTION_TRACKER: RejectionTracker = RejectionTracker;

fn to_engine_error(prefix: &str, err: impl std::fmt::Display) -> SandboxError {
    SandboxError::Engine(format!("{prefix}: {err}"))
}

/// Builds a fresh engine instance wired to the rejection tracker.
pub(crate) fn build_context() -> Result<Context> {
    Context::builder()
        .host_hooks(&REJECTION_TRACKER)
        .build()
        .map_err(|e| to_engine_error("failed to build context", e))
}

/// Registers the natives, runs the prelude and returns the renderer.
pub(crate) fn install(context: &mut Context) -> Result<JsObject> {
    let natives: [(&str, usize, NativeFunction); 5] = [
        (BRIDGE_NAME, 1, NativeFunction::from_fn_ptr(post_console)),
        ("setTimeout", 2, NativeFunction::from_fn_ptr(set_timeout)),
        ("setInterval", 2, NativeFunction::from_fn_ptr(set_interval)),
        ("clearTimeout", 1, NativeFunction::from_fn_ptr(clear_timer)),
        ("clearInterval", 1, NativeFunction::from_fn_ptr(clear_timer)),
    ];
    for (name, length, function) in natives {
        context
            .register_global_builtin_callable(js_string!(name), length, function)
            .map_err(|e| to_engine_error(&format!("failed to register {name}"), e))?;
    }

    let renderer = context
        .eval(Source::from_bytes(PRELUDE))
        .map_err(|e| to_engine_error("harness prelude failed", e))?;
    context.run_jobs();

    renderer
        .as_callable()
        .cloned()
        .ok_or_else(|| SandboxError::Engine("harness prelude returned no renderer".to_string()))
}

fn harness_missing() -> JsError {
    JsNativeError::error()
        .with_message("sandbox harness is not installed on this thread")
        .into()
}

fn post_console(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let Some((method, rest)) = args.split_first() else {
        return Ok(JsValue::undefined());
    };
    let method = method.to_string(context)?.to_std_string_escaped();
    let method = ConsoleMethod::from_name(&method).unwrap_or(ConsoleMethod::Log);

    let rendered = rest
        .iter()
        .map(|arg| {
            arg.to_string(context)
                .map(|text| text.to_std_string_escaped())
        })
        .collect::<JsResult<Vec<_>>>()?;

    let connected = with_harness(|harness| {
        harness.post(WorkerMessage::Console {
            method,
            args: rendered,
        });
        !harness.is_disconnected()
    })
    .ok_or_else(harness_missing)?;

    // Nobody is listening; unwind user code.
    if !connected {
        return Err(JsNativeError::error()
            .with_message("execution context was torn down")
            .into());
    }
    Ok(JsValue::undefined())
}

fn schedule_timer(args: &[JsValue], repeat: bool, context: &mut Context) -> JsResult<JsValue> {
    let callback = args
        .first()
        .and_then(JsValue::as_callable)
        .cloned()
        .ok_or_else(|| {
            JsError::from(JsNativeError::typ().with_message("timer callback is not a function"))
        })?;
    let delay = match args.get(1) {
        Some(value) => value.to_number(context)?,
        None => 0.0,
    };
    let extra = args.get(2..).map(<[JsValue]>::to_vec).unwrap_or_default();

    let task = TimerTask {
        callback,
        args: extra,
    };
    let id = with_harness(|harness| {
        harness
            .timers
            .schedule(task, clamp_delay(delay), repeat, Instant::now())
    })
    .ok_or_else(harness_missing)?;
    Ok(JsValue::from(id))
}

fn set_timeout(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    schedule_timer(args, false, context)
}

fn set_interval(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    schedule_timer(args, true, context)
}

fn clear_timer(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let Some(id) = args.first() else {
        return Ok(JsValue::undefined());
    };
    let id = id.to_number(context)?;
    if id.is_finite() && id >= 1.0 && id <= f64::from(u32::MAX) {
        with_harness(|harness| harness.timers.clear(id as u32));
    }
    Ok(JsValue::undefined())
}
