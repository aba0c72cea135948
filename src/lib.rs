pub mod assembler;
pub mod cli;
pub mod config;
pub mod delegate;
pub mod error;
pub mod marshal;
pub mod sandbox;
pub mod shim;

pub use assembler::PluginRequest;
pub use delegate::{DelegateError, DelegateSet, FetchDelegate, HostDelegate};
pub use error::{FailureKind, FailureReport, PlugletError, Result};
pub use sandbox::{PluginOutcome, PluginRunner, SandboxLimits};
