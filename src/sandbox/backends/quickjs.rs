use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rquickjs::convert::Coerced;
use rquickjs::function::This;
use rquickjs::{Context, Ctx, Function, Object, Persistent, Runtime, Value};
use tracing::{debug, error, info, warn};

use super::heap::{stack_position, HeapMeter, MeteredAllocator};
use crate::assembler::{FAULT_MARSHAL, FAULT_MISSING_ENTRY};
use crate::error::{PlugletError, Result};
use crate::sandbox::bridge::{DelegateCall, DelegateRef, DelegateReply};
use crate::sandbox::lifecycle::LifecycleState;
use crate::sandbox::traits::{ContextBinding, SandboxContext, SandboxEngine, SandboxLimits};
use crate::shim::{HOST_BIND, HOST_CALL, HOST_LOG, HOST_MARK};

/// How often a context blocked on a delegate reply rechecks cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Distance above the engine's stack limit that still counts as reaching it.
/// Covers the frame the engine reserves before its stack check fires.
const STACK_SLACK: usize = 64 * 1024;

/// Most capability errors remembered per context.
const MAX_MARKS: usize = 1024;

/// QuickJS engine: one runtime per context, so each context gets its own heap
/// and its own memory ceiling.
#[derive(Debug, Default, Clone)]
pub struct QuickJsEngine;

impl QuickJsEngine {
    pub fn new() -> Self {
        Self
    }
}

impl SandboxEngine for QuickJsEngine {
    fn name(&self) -> &str {
        "quickjs"
    }

    fn create(
        &self,
        limits: &SandboxLimits,
        binding: ContextBinding,
    ) -> Result<Box<dyn SandboxContext>> {
        let meter = HeapMeter::new();
        let allocator = MeteredAllocator::new(limits.memory_limit_bytes, meter.clone());
        let runtime = Runtime::new_with_alloc(allocator)
            .map_err(|e| PlugletError::SandboxInit(format!("Failed to create runtime: {}", e)))?;
        runtime.set_max_stack_size(limits.max_stack_bytes);
        // The engine measures its stack from where the runtime was created
        let stack_floor = (limits.max_stack_bytes > 0)
            .then(|| stack_position().saturating_sub(limits.max_stack_bytes));

        let interrupted = Arc::new(AtomicBool::new(false));
        {
            let cancel = binding.cancel.clone();
            let interrupted = interrupted.clone();
            let deadline = binding.deadline;
            runtime.set_interrupt_handler(Some(Box::new(move || {
                if cancel.load(Ordering::Relaxed) || Instant::now() >= deadline {
                    interrupted.store(true, Ordering::Relaxed);
                    true
                } else {
                    false
                }
            })));
        }

        let context = Context::full(&runtime)
            .map_err(|e| PlugletError::SandboxInit(format!("Failed to create context: {}", e)))?;

        let mut sandbox = QuickJsContext {
            state: LifecycleState::Created,
            plugin_id: binding.plugin_id,
            limits: limits.clone(),
            shared: Rc::new(Shared::default()),
            delegates: binding.endpoint.delegates,
            replies: binding.endpoint.replies,
            cancel: binding.cancel,
            interrupted,
            meter,
            stack_floor,
            deadline: binding.deadline,
            entry: None,
            context,
            runtime,
        };
        sandbox.trace();

        let bound = sandbox.context.with(|ctx| {
            bind_host(
                &ctx,
                &sandbox.shared,
                &sandbox.delegates,
                &sandbox.plugin_id,
                sandbox.limits.max_delegate_calls,
            )
        });
        if let Err(e) = bound {
            return Err(PlugletError::SandboxInit(format!(
                "Failed to bind host functions: {}",
                e
            )));
        }
        sandbox.transition(LifecycleState::DelegatesBound);

        Ok(Box::new(sandbox))
    }
}

/// State shared between the context and the host functions bound into it.
#[derive(Default)]
struct Shared {
    settle: RefCell<Option<Persistent<Function<'static>>>>,
    outcome: RefCell<Option<std::result::Result<String, JsFailure>>>,
    // Error objects the preamble created for rejected delegate calls
    marked: RefCell<Vec<Persistent<Value<'static>>>>,
    in_flight: Cell<usize>,
    calls_made: Cell<usize>,
}

impl Shared {
    /// Record the entry outcome; the first one wins.
    fn conclude(&self, outcome: std::result::Result<String, JsFailure>) {
        let mut slot = self.outcome.borrow_mut();
        if slot.is_none() {
            *slot = Some(outcome);
        }
    }

    fn is_marked<'js>(&self, ctx: &Ctx<'js>, value: &Value<'js>) -> bool {
        self.marked.borrow().iter().any(|mark| {
            mark.clone()
                .restore(ctx)
                .map(|mark| mark == *value)
                .unwrap_or(false)
        })
    }
}

/// Failure reported by the entry harness itself rather than thrown.
#[derive(Debug, Clone)]
enum HarnessFault {
    MissingEntry(String),
    Marshal(String),
}

/// A thrown JavaScript value, reduced to what the host reports.
#[derive(Debug, Clone, Default)]
struct JsFailure {
    name: Option<String>,
    message: String,
    /// Set only for errors the preamble marked as capability failures.
    capability: Option<String>,
    fault: Option<HarnessFault>,
}

impl JsFailure {
    fn plain(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

pub struct QuickJsContext {
    state: LifecycleState,
    plugin_id: String,
    limits: SandboxLimits,
    shared: Rc<Shared>,
    delegates: DelegateRef,
    replies: Receiver<DelegateReply>,
    cancel: Arc<AtomicBool>,
    interrupted: Arc<AtomicBool>,
    meter: Arc<HeapMeter>,
    stack_floor: Option<usize>,
    deadline: Instant,
    // Persistent handles must be released before the runtime; see Drop.
    entry: Option<Persistent<Function<'static>>>,
    context: Context,
    runtime: Runtime,
}

impl QuickJsContext {
    fn transition(&mut self, state: LifecycleState) {
        self.state = state;
        self.trace();
    }

    fn trace(&self) {
        debug!(plugin = %self.plugin_id, state = %self.state, "Sandbox context state");
    }

    fn timeout(&self) -> PlugletError {
        PlugletError::Timeout {
            timeout_ms: self.limits.timeout_ms(),
        }
    }

    fn memory_exceeded(&self) -> PlugletError {
        PlugletError::MemoryLimitExceeded {
            limit_mb: self.limits.memory_limit_mb(),
        }
    }

    /// Map a failure to the error reported to the caller.
    ///
    /// Only host-side facts select a kind other than `PluginThrew`: the
    /// interrupt flag, harness faults, the heap meter and capability marks.
    /// The thrown value's name and message are plugin-controlled.
    fn failure(&self, failure: JsFailure) -> PlugletError {
        if self.interrupted.load(Ordering::SeqCst) {
            return self.timeout();
        }
        match failure.fault {
            Some(HarnessFault::MissingEntry(name)) => {
                return PlugletError::EntryPointNotFound { name };
            }
            Some(HarnessFault::Marshal(message)) => return PlugletError::Marshal(message),
            None => {}
        }
        if self.meter.exhausted() {
            return self.memory_exceeded();
        }
        if self
            .stack_floor
            .is_some_and(|floor| self.meter.stack_reached(floor.saturating_add(STACK_SLACK)))
        {
            return PlugletError::StackOverflow;
        }

        match failure.capability {
            Some(capability) => PlugletError::Capability {
                capability,
                message: failure.message,
            },
            None => PlugletError::PluginThrew {
                name: failure.name.unwrap_or_else(|| "Error".to_string()),
                message: failure.message,
            },
        }
    }

    fn fail(&mut self, err: PlugletError) -> PlugletError {
        self.transition(LifecycleState::Failed);
        err
    }

    /// Run queued jobs until the queue is empty.
    fn drain_jobs(&self) -> std::result::Result<(), PlugletError> {
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => return Ok(()),
                Err(job) => {
                    // The exception's context handle was never counted; dropping it would free ours
                    std::mem::forget(job);
                    let failure = self
                        .context
                        .with(|ctx| describe(&ctx, &self.shared, &ctx.catch()));
                    return Err(self.failure(failure));
                }
            }
        }
    }

    fn wait_for_reply(&self) -> std::result::Result<DelegateReply, PlugletError> {
        loop {
            let now = Instant::now();
            if self.cancel.load(Ordering::SeqCst) || now >= self.deadline {
                self.interrupted.store(true, Ordering::SeqCst);
                return Err(self.timeout());
            }
            let wait = self.deadline.saturating_duration_since(now).min(CANCEL_POLL);
            match self.replies.recv_timeout(wait) {
                Ok(reply) => return Ok(reply),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(PlugletError::HostDisconnected),
            }
        }
    }

    fn settle(&self, reply: DelegateReply) -> std::result::Result<(), PlugletError> {
        let settle = self.shared.settle.borrow().clone();
        let Some(settle) = settle else {
            return Err(PlugletError::SandboxInit(
                "settle callback was never registered".to_string(),
            ));
        };

        let (ok, payload) = match reply.result {
            Ok(json) => (true, json),
            Err(e) => (false, e.message),
        };

        let settled = self.context.with(|ctx| {
            settle
                .restore(&ctx)
                .and_then(|f| f.call::<_, ()>((reply.call_id, ok, payload)))
                .map_err(|e| failure_from(&ctx, &self.shared, e))
        });
        settled.map_err(|f| self.failure(f))
    }

    fn run_until_settled(&mut self) -> std::result::Result<String, PlugletError> {
        loop {
            self.drain_jobs()?;

            let outcome = self.shared.outcome.borrow_mut().take();
            if let Some(outcome) = outcome {
                return outcome.map_err(|f| self.failure(f));
            }
            if self.interrupted.load(Ordering::SeqCst) {
                return Err(self.timeout());
            }
            if self.shared.in_flight.get() == 0 {
                // A refused allocation can drop the job that would have settled the entry
                if self.meter.exhausted() {
                    return Err(self.memory_exceeded());
                }
                return Err(PlugletError::EntryPointNeverSettled);
            }

            let reply = self.wait_for_reply()?;
            self.shared.in_flight.set(self.shared.in_flight.get() - 1);
            self.settle(reply)?;
        }
    }
}

impl SandboxContext for QuickJsContext {
    fn state(&self) -> LifecycleState {
        self.state
    }

    fn evaluate(&mut self, source: &str) -> Result<()> {
        let evaluated = self.context.with(|ctx| {
            let value: Value = ctx
                .eval(source)
                .map_err(|e| failure_from(&ctx, &self.shared, e))?;
            match value.into_function() {
                Some(entry) => Ok(Persistent::save(&ctx, entry)),
                None => Err(JsFailure::plain("script did not produce an entry function")),
            }
        });

        match evaluated {
            Ok(entry) => {
                self.entry = Some(entry);
                self.transition(LifecycleState::Evaluated);
                Ok(())
            }
            Err(failure) => {
                let err = match self.failure(failure) {
                    PlugletError::PluginThrew { name, message } => PlugletError::Evaluation {
                        message: format!("{}: {}", name, message),
                    },
                    other => other,
                };
                Err(self.fail(err))
            }
        }
    }

    fn invoke(&mut self, params_json: &str, settings_json: &str) -> Result<String> {
        let Some(entry) = self.entry.take() else {
            return Err(self.fail(PlugletError::Evaluation {
                message: "context has no evaluated entry function".to_string(),
            }));
        };
        self.transition(LifecycleState::Invoked);

        let shared = self.shared.clone();
        let started = self.context.with(|ctx| {
            entry
                .restore(&ctx)
                .and_then(|f| start_entry(&ctx, &shared, f, params_json, settings_json))
                .map_err(|e| failure_from(&ctx, &shared, e))
        });

        let result = match started {
            Ok(()) => self.run_until_settled(),
            Err(failure) => Err(self.failure(failure)),
        };

        match result {
            Ok(json) => {
                self.transition(LifecycleState::Result);
                Ok(json)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn destroy(mut self: Box<Self>) {
        self.release();
        self.transition(LifecycleState::TornDown);
    }
}

impl QuickJsContext {
    fn release(&mut self) {
        self.delegates.detach();
        self.entry.take();
        self.shared.settle.borrow_mut().take();
        self.shared.outcome.borrow_mut().take();
        self.shared.marked.borrow_mut().clear();
    }
}

impl Drop for QuickJsContext {
    fn drop(&mut self) {
        self.release();
    }
}

/// Install the raw host functions the preamble captures.
fn bind_host<'js>(
    ctx: &Ctx<'js>,
    shared: &Rc<Shared>,
    delegates: &DelegateRef,
    plugin_id: &str,
    max_calls: usize,
) -> rquickjs::Result<()> {
    let globals = ctx.globals();
    globals.set("global", globals.clone())?;

    let id = plugin_id.to_string();
    globals.set(
        HOST_LOG,
        Function::new(ctx.clone(), move |level: String, message: String| {
            plugin_log(&id, &level, &message);
        })?,
    )?;

    let call_shared = shared.clone();
    let delegates = delegates.clone();
    globals.set(
        HOST_CALL,
        Function::new(
            ctx.clone(),
            move |call_id: u32, capability: String, args: String| -> Option<String> {
                if call_shared.calls_made.get() >= max_calls {
                    return Some(format!("delegate call limit of {} reached", max_calls));
                }
                let args = match serde_json::from_str(&args) {
                    Ok(args) => args,
                    Err(e) => return Some(format!("arguments cannot be copied: {}", e)),
                };
                let call = DelegateCall {
                    call_id,
                    capability,
                    args,
                };
                match delegates.invoke(call) {
                    Ok(()) => {
                        call_shared.calls_made.set(call_shared.calls_made.get() + 1);
                        call_shared.in_flight.set(call_shared.in_flight.get() + 1);
                        None
                    }
                    Err(e) => Some(e.to_string()),
                }
            },
        )?,
    )?;

    let bind_shared = shared.clone();
    globals.set(
        HOST_BIND,
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, settle: Function<'js>| {
            *bind_shared.settle.borrow_mut() = Some(Persistent::save(&ctx, settle));
        })?,
    )?;

    let mark_shared = shared.clone();
    globals.set(
        HOST_MARK,
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, error: Value<'js>| {
            let mut marked = mark_shared.marked.borrow_mut();
            if marked.len() < MAX_MARKS {
                marked.push(Persistent::save(&ctx, error));
            }
        })?,
    )?;

    Ok(())
}

/// Call the entry function and attach handlers that record its outcome.
fn start_entry<'js>(
    ctx: &Ctx<'js>,
    shared: &Rc<Shared>,
    entry: Function<'js>,
    params_json: &str,
    settings_json: &str,
) -> rquickjs::Result<()> {
    let fault_shared = shared.clone();
    let fault = Function::new(ctx.clone(), move |kind: String, detail: String| {
        let failure = match kind.as_str() {
            FAULT_MISSING_ENTRY => JsFailure {
                fault: Some(HarnessFault::MissingEntry(detail)),
                ..Default::default()
            },
            FAULT_MARSHAL => JsFailure {
                fault: Some(HarnessFault::Marshal(detail)),
                ..Default::default()
            },
            other => JsFailure::plain(format!("unknown harness fault '{}'", other)),
        };
        fault_shared.conclude(Err(failure));
    })?;

    let promise: Object<'js> =
        entry.call((params_json.to_string(), settings_json.to_string(), fault))?;
    let then: Function<'js> = promise.get("then")?;

    let ok_shared = shared.clone();
    let on_ok = Function::new(ctx.clone(), move |json: Option<String>| {
        let outcome = json.ok_or_else(|| JsFailure::plain("entry point produced no result"));
        ok_shared.conclude(outcome);
    })?;

    let err_shared = shared.clone();
    let on_err = Function::new(ctx.clone(), move |ctx: Ctx<'js>, reason: Value<'js>| {
        let failure = describe(&ctx, &err_shared, &reason);
        err_shared.conclude(Err(failure));
    })?;

    then.call::<_, ()>((This(promise), on_ok, on_err))
}

fn failure_from<'js>(ctx: &Ctx<'js>, shared: &Shared, err: rquickjs::Error) -> JsFailure {
    match err {
        rquickjs::Error::Exception => describe(ctx, shared, &ctx.catch()),
        rquickjs::Error::Allocation => JsFailure::plain("out of memory"),
        other => JsFailure::plain(other.to_string()),
    }
}

fn describe<'js>(ctx: &Ctx<'js>, shared: &Shared, value: &Value<'js>) -> JsFailure {
    let Some(object) = value.as_object() else {
        let message = value
            .get::<Coerced<String>>()
            .map(|c| c.0)
            .unwrap_or_else(|_| "unknown error".to_string());
        return JsFailure::plain(message);
    };

    let prop = |key: &str| -> Option<String> {
        object
            .get::<_, Option<Coerced<String>>>(key)
            .ok()
            .flatten()
            .map(|c| c.0)
    };

    let capability = if shared.is_marked(ctx, value) {
        Some(prop("capability").unwrap_or_else(|| "unknown".to_string()))
    } else {
        None
    };

    JsFailure {
        name: prop("name"),
        message: prop("message").unwrap_or_else(|| "unknown error".to_string()),
        capability,
        fault: None,
    }
}

fn plugin_log(plugin: &str, level: &str, message: &str) {
    match level {
        "error" => error!(target: "pluglet::plugin", plugin = %plugin, "{}", message),
        "warn" => warn!(target: "pluglet::plugin", plugin = %plugin, "{}", message),
        "debug" => debug!(target: "pluglet::plugin", plugin = %plugin, "{}", message),
        _ => info!(target: "pluglet::plugin", plugin = %plugin, "{}", message),
    }
}
