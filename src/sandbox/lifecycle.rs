use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::assembler::AssembledPlugin;
use crate::error::Result;
use crate::sandbox::traits::{ContextBinding, SandboxEngine, SandboxLimits};

/// States a context moves through. Every context reaches `TornDown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    DelegatesBound,
    Evaluated,
    Invoked,
    Result,
    Failed,
    TornDown,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::DelegatesBound => "delegates_bound",
            Self::Evaluated => "evaluated",
            Self::Invoked => "invoked",
            Self::Result => "result",
            Self::Failed => "failed",
            Self::TornDown => "torn_down",
        };
        f.write_str(s)
    }
}

/// A context that has been created and not yet torn down.
#[derive(Debug, Clone, Serialize)]
pub struct LiveContext {
    pub context_id: String,
    pub plugin_id: String,
    pub created_at: DateTime<Utc>,
}

/// Tracks live contexts so callers can verify that none outlive their
/// invocation.
#[derive(Debug, Clone, Default)]
pub struct ContextRegistry {
    inner: Arc<Mutex<HashMap<String, LiveContext>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new context. It stays listed until the guard is dropped.
    pub fn register(&self, plugin_id: &str) -> ContextGuard {
        let context = LiveContext {
            context_id: generate_context_id(),
            plugin_id: plugin_id.to_string(),
            created_at: Utc::now(),
        };
        let context_id = context.context_id.clone();
        self.lock().insert(context_id.clone(), context);

        ContextGuard {
            registry: self.clone(),
            context_id,
        }
    }

    pub fn live_count(&self) -> usize {
        self.lock().len()
    }

    pub fn list(&self) -> Vec<LiveContext> {
        let mut contexts: Vec<_> = self.lock().values().cloned().collect();
        contexts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        contexts
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, LiveContext>> {
        // A panic while holding the lock leaves the map itself consistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes its context from the registry when dropped, including on unwind.
#[derive(Debug)]
pub struct ContextGuard {
    registry: ContextRegistry,
    context_id: String,
}

impl ContextGuard {
    pub fn context_id(&self) -> &str {
        &self.context_id
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.context_id);
    }
}

/// Run one plugin through a fresh context: create, bind, evaluate, invoke,
/// tear down. Teardown happens whatever the outcome.
pub fn run_in_context(
    engine: &dyn SandboxEngine,
    limits: &SandboxLimits,
    plugin: &AssembledPlugin,
    binding: ContextBinding,
    registry: &ContextRegistry,
) -> Result<String> {
    let guard = registry.register(&plugin.id);
    debug!(
        plugin = %plugin.id,
        context = %guard.context_id(),
        engine = engine.name(),
        "Creating sandbox context"
    );

    let mut context = engine.create(limits, binding)?;
    let result = context
        .evaluate(&plugin.source)
        .and_then(|()| context.invoke(&plugin.params_json, &plugin.settings_json));
    context.destroy();
    drop(guard);

    if let Err(ref e) = result {
        warn!(plugin = %plugin.id, kind = ?e.kind(), error = %e, "Plugin invocation failed");
    }
    result
}

/// Generate a short context ID
fn generate_context_id() -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let counter = COUNTER.fetch_add(1, Ordering::SeqCst);

    // Low timestamp bits plus a 16-bit counter, in base36
    let combined = (timestamp & 0xFFFFFF) << 16 | (counter as u64 & 0xFFFF);
    format!("ctx-{}", format_base36(combined))
}

fn format_base36(mut n: u64) -> String {
    const CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if n == 0 {
        return "0".to_string();
    }

    let mut digits = Vec::new();
    while n > 0 {
        digits.push(CHARS[(n % 36) as usize] as char);
        n /= 36;
    }
    digits.iter().rev().collect()
}
