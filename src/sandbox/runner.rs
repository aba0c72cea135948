use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, info, warn};

use crate::assembler::{assemble, PluginRequest};
use crate::config::PlugletConfig;
use crate::delegate::{DelegateError, DelegateSet};
use crate::error::{PlugletError, Result};
use crate::marshal::{copy_in, copy_out};
use crate::sandbox::backends::QuickJsEngine;
use crate::sandbox::bridge::{self, DelegateCall, DelegateReply, HostEndpoint};
use crate::sandbox::lifecycle::{run_in_context, ContextRegistry};
use crate::sandbox::traits::{ContextBinding, SandboxEngine, SandboxLimits};

/// Stack for sandbox threads beyond the engine's own stack ceiling.
const THREAD_STACK_HEADROOM: usize = 4 * 1024 * 1024;

/// How long the host waits past the sandbox deadline before giving up on
/// the sandbox thread.
const HOST_GRACE: Duration = Duration::from_secs(1);

/// A successful invocation.
#[derive(Debug, Clone, Serialize)]
pub struct PluginOutcome {
    pub id: String,
    pub value: Value,
    pub delegate_calls: usize,
    pub elapsed_ms: u64,
}

/// Runs plugins, one fresh context per invocation.
///
/// This is `Send + Sync`: each context lives on a dedicated thread, while
/// delegate calls are served from the caller's task. A semaphore bounds the
/// number of contexts alive at once.
pub struct PluginRunner {
    limits: SandboxLimits,
    delegates: Arc<DelegateSet>,
    engine: Arc<dyn SandboxEngine>,
    semaphore: Arc<Semaphore>,
    registry: ContextRegistry,
}

impl PluginRunner {
    pub fn new(limits: SandboxLimits, delegates: DelegateSet) -> Self {
        let semaphore = Arc::new(Semaphore::new(limits.max_concurrent));
        Self {
            limits,
            delegates: Arc::new(delegates),
            engine: Arc::new(QuickJsEngine::new()),
            semaphore,
            registry: ContextRegistry::new(),
        }
    }

    /// A runner with the fetch capability configured from `config`.
    pub fn from_config(config: &PlugletConfig) -> Result<Self> {
        let delegates = DelegateSet::with_fetch(&config.fetch)?;
        Ok(Self::new(SandboxLimits::from(&config.sandbox), delegates))
    }

    pub fn with_engine(mut self, engine: Arc<dyn SandboxEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    pub fn delegates(&self) -> &DelegateSet {
        &self.delegates
    }

    pub fn registry(&self) -> &ContextRegistry {
        &self.registry
    }

    /// Number of contexts created and not yet torn down.
    pub fn live_contexts(&self) -> usize {
        self.registry.live_count()
    }

    /// Run a plugin and return only its result value.
    pub async fn run_value(&self, request: &PluginRequest) -> Result<Value> {
        self.run(request).await.map(|outcome| outcome.value)
    }

    /// Run a plugin's entry point in a fresh context.
    ///
    /// The context is torn down before this returns, whatever the outcome.
    /// Dropping the returned future cancels the invocation.
    pub async fn run(&self, request: &PluginRequest) -> Result<PluginOutcome> {
        let started = Instant::now();
        info!(
            plugin = %request.id(),
            entry = %request.name,
            code_len = request.code.len(),
            "Invoking plugin"
        );

        let plugin = assemble(request, &self.delegates, self.limits.max_code_bytes)?;

        let permit = self.semaphore.clone().try_acquire_owned().map_err(|_| {
            PlugletError::ConcurrencyLimit {
                max: self.limits.max_concurrent,
            }
        })?;

        let (endpoint, host) = bridge::channel();
        let cancel = CancelOnDrop::default();
        let binding = ContextBinding {
            plugin_id: plugin.id.clone(),
            endpoint,
            cancel: cancel.flag(),
            deadline: Instant::now() + self.limits.timeout,
        };

        let id = plugin.id.clone();
        let engine = self.engine.clone();
        let limits = self.limits.clone();
        let registry = self.registry.clone();

        // Contexts are !Send: each one lives and dies on its own thread
        let (tx, rx) = oneshot::channel();
        std::thread::Builder::new()
            .name("pluglet-sandbox".to_string())
            .stack_size(limits.max_stack_bytes + THREAD_STACK_HEADROOM)
            .spawn(move || {
                // Held until the context is gone, even if the host stopped waiting
                let _permit = permit;
                let result = run_in_context(engine.as_ref(), &limits, &plugin, binding, &registry);
                if tx.send(result).is_err() {
                    warn!("sandbox result receiver dropped before result was sent");
                }
            })
            .map_err(|e| PlugletError::SandboxInit(format!("Failed to spawn sandbox thread: {}", e)))?;

        let result = self.serve(host, rx).await;
        drop(cancel);

        let (json, delegate_calls) = result?;
        let value = copy_out(&json, self.limits.max_output_bytes)?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        info!(plugin = %id, delegate_calls, elapsed_ms, "Plugin invocation complete");

        Ok(PluginOutcome {
            id,
            value,
            delegate_calls,
            elapsed_ms,
        })
    }

    /// Serve delegate calls for one context until it reports a result.
    async fn serve(
        &self,
        host: HostEndpoint,
        mut done: oneshot::Receiver<Result<String>>,
    ) -> Result<(String, usize)> {
        let HostEndpoint { mut calls, replies } = host;
        let mut in_flight = FuturesUnordered::new();
        let mut calls_open = true;
        let mut received = 0usize;

        let deadline = tokio::time::sleep(self.limits.timeout + HOST_GRACE);
        tokio::pin!(deadline);

        let result = loop {
            tokio::select! {
                call = calls.recv(), if calls_open => match call {
                    Some(call) => {
                        received += 1;
                        debug!(
                            seq = received,
                            call_id = call.call_id,
                            capability = %call.capability,
                            "Delegate call received"
                        );
                        in_flight.push(self.dispatch(call));
                    }
                    None => calls_open = false,
                },
                Some(reply) = in_flight.next(), if !in_flight.is_empty() => {
                    if replies.send(reply).is_err() {
                        debug!("Sandbox exited before a delegate reply was delivered");
                    }
                }
                result = &mut done => {
                    break result.unwrap_or(Err(PlugletError::SandboxLost));
                }
                _ = &mut deadline => {
                    break Err(PlugletError::Timeout {
                        timeout_ms: self.limits.timeout_ms(),
                    });
                }
            }
        };

        if !in_flight.is_empty() {
            debug!(pending = in_flight.len(), "Abandoning unfinished delegate calls");
        }
        result.map(|json| (json, received))
    }

    async fn dispatch(&self, call: DelegateCall) -> DelegateReply {
        let result = self
            .delegates
            .dispatch(&call.capability, call.args)
            .await
            .and_then(|value| copy_in(&value).map_err(|e| DelegateError::new(e.to_string())));

        DelegateReply {
            call_id: call.call_id,
            result,
        }
    }
}

/// Raises the cancellation flag when the invocation ends or is dropped.
#[derive(Default)]
struct CancelOnDrop {
    flag: Arc<AtomicBool>,
}

impl CancelOnDrop {
    fn flag(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}
