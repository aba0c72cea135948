use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::SandboxConfig;
use crate::error::Result;
use crate::sandbox::bridge::SandboxEndpoint;
use crate::sandbox::lifecycle::LifecycleState;

/// Resource ceilings applied to every context.
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub memory_limit_bytes: usize,
    pub max_stack_bytes: usize,
    pub timeout: Duration,
    pub max_code_bytes: usize,
    pub max_output_bytes: usize,
    pub max_delegate_calls: usize,
    pub max_concurrent: usize,
}

impl SandboxLimits {
    pub fn memory_limit_mb(&self) -> u64 {
        (self.memory_limit_bytes / (1024 * 1024)) as u64
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }
}

impl From<&SandboxConfig> for SandboxLimits {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            memory_limit_bytes: (config.memory_limit_mb as usize) * 1024 * 1024,
            max_stack_bytes: (config.max_stack_kb as usize) * 1024,
            timeout: Duration::from_millis(config.timeout_ms),
            max_code_bytes: config.max_code_bytes,
            max_output_bytes: config.max_output_bytes,
            max_delegate_calls: config.max_delegate_calls,
            max_concurrent: config.max_concurrent,
        }
    }
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self::from(&SandboxConfig::default())
    }
}

/// Everything a new context needs to reach its host.
pub struct ContextBinding {
    /// Correlation id used in logs
    pub plugin_id: String,
    pub endpoint: SandboxEndpoint,
    /// Set by the host when the caller gives up on the invocation
    pub cancel: Arc<AtomicBool>,
    pub deadline: Instant,
}

/// A JavaScript engine able to create isolated contexts.
pub trait SandboxEngine: Send + Sync {
    /// Returns the engine name (e.g., "quickjs")
    fn name(&self) -> &str;

    /// Create a context with its memory ceiling applied and host delegates
    /// bound. The context lives on the calling thread.
    fn create(&self, limits: &SandboxLimits, binding: ContextBinding)
        -> Result<Box<dyn SandboxContext>>;
}

/// One single-use execution context.
pub trait SandboxContext {
    fn state(&self) -> LifecycleState;

    /// Evaluate the assembled script; its completion value is the entry function.
    fn evaluate(&mut self, source: &str) -> Result<()>;

    /// Call the entry function and run the event loop until its promise settles.
    /// Returns the result as JSON text.
    fn invoke(&mut self, params_json: &str, settings_json: &str) -> Result<String>;

    /// Release the context. Delegate references held by it become unusable.
    fn destroy(self: Box<Self>);
}
