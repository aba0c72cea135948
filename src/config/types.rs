use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlugletConfig {
    pub sandbox: SandboxConfig,
    pub fetch: FetchConfig,
}

/// Limits applied to every sandbox context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Heap ceiling of a single context in MB
    pub memory_limit_mb: u64,
    /// Native stack ceiling in KB
    pub max_stack_kb: u64,
    /// Wall-clock deadline for one invocation in milliseconds
    pub timeout_ms: u64,
    /// Largest accepted plugin source in bytes
    pub max_code_bytes: usize,
    /// Largest accepted serialized result in bytes
    pub max_output_bytes: usize,
    /// Delegate calls one invocation may issue
    pub max_delegate_calls: usize,
    /// Contexts that may exist at the same time
    pub max_concurrent: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: 128,
            max_stack_kb: 1024,
            timeout_ms: 30_000,
            max_code_bytes: 256 * 1024,
            max_output_bytes: 4 * 1024 * 1024,
            max_delegate_calls: 64,
            max_concurrent: 16,
        }
    }
}

/// Configuration of the host-side fetch capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Per-request timeout in seconds
    pub timeout_seconds: u64,
    /// Largest response body handed to a plugin, in bytes
    pub max_body_bytes: usize,
    /// URL schemes plugins may request
    pub allowed_schemes: Vec<String>,
    /// User-Agent header sent with every request
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 15,
            max_body_bytes: 8 * 1024 * 1024,
            allowed_schemes: vec!["http".to_string(), "https".to_string()],
            user_agent: format!("pluglet/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}
