use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlugletError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    // Assembly errors
    #[error("Invalid entry point name '{name}': {reason}")]
    InvalidEntryPoint { name: String, reason: String },

    #[error("Plugin source is {size} bytes, limit is {max}")]
    CodeTooLarge { size: usize, max: usize },

    #[error("Plugin entry point '{name}' is not defined")]
    EntryPointNotFound { name: String },

    #[error("Plugin evaluation failed: {message}")]
    Evaluation { message: String },

    // Sandbox errors
    #[error("Sandbox initialization failed: {0}")]
    SandboxInit(String),

    #[error("Sandbox memory limit of {limit_mb} MB exceeded")]
    MemoryLimitExceeded { limit_mb: u64 },

    #[error("Sandbox stack limit exceeded")]
    StackOverflow,

    #[error("Sandbox timeout after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("Concurrency limit reached ({max} sandboxes running)")]
    ConcurrencyLimit { max: usize },

    #[error("Plugin entry point returned a promise that can never settle")]
    EntryPointNeverSettled,

    #[error("Delegate '{delegate}' used after its sandbox context was torn down")]
    DelegateDetached { delegate: String },

    #[error("Sandbox thread exited without reporting a result")]
    SandboxLost,

    #[error("Host side of the sandbox bridge disconnected")]
    HostDisconnected,

    // Plugin errors
    #[error("{name}: {message}")]
    PluginThrew { name: String, message: String },

    #[error("Capability '{capability}' failed: {message}")]
    Capability { capability: String, message: String },

    // Marshaling errors
    #[error("Value cannot cross the sandbox boundary: {0}")]
    Marshal(String),

    #[error("Plugin result is {size} bytes, limit is {max}")]
    OutputTooLarge { size: usize, max: usize },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // Generic wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse failure category reported to callers of the invocation API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Assembly,
    Capability,
    ResourceLimit,
    Timeout,
    Plugin,
    Lifecycle,
    Marshal,
    Host,
}

/// Serializable failure summary: the kind plus a message without stack detail.
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub kind: FailureKind,
    pub message: String,
}

impl PlugletError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::InvalidEntryPoint { .. }
            | Self::CodeTooLarge { .. }
            | Self::EntryPointNotFound { .. }
            | Self::Evaluation { .. } => FailureKind::Assembly,
            Self::Capability { .. } => FailureKind::Capability,
            Self::MemoryLimitExceeded { .. }
            | Self::StackOverflow
            | Self::ConcurrencyLimit { .. } => FailureKind::ResourceLimit,
            Self::Timeout { .. } | Self::EntryPointNeverSettled => FailureKind::Timeout,
            Self::PluginThrew { .. } => FailureKind::Plugin,
            Self::DelegateDetached { .. } | Self::SandboxLost | Self::HostDisconnected => {
                FailureKind::Lifecycle
            }
            Self::Marshal(_) | Self::OutputTooLarge { .. } | Self::Json(_) => FailureKind::Marshal,
            Self::Config(_)
            | Self::ConfigNotFound { .. }
            | Self::TomlParse(_)
            | Self::SandboxInit(_)
            | Self::Io(_)
            | Self::Http(_)
            | Self::Other(_) => FailureKind::Host,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyLimit { .. } | Self::Timeout { .. })
    }

    pub fn report(&self) -> FailureReport {
        FailureReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PlugletError>;
