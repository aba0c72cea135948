//! Host delegates: privileged functions the sandbox may call by reference.
//!
//! Each capability is one [`HostDelegate`]: the async host function plus the
//! JavaScript shim that exposes it inside the sandbox. Plugins never see the
//! delegate itself, only the shim's wrapper.

mod fetch;

pub use fetch::{FetchDelegate, FetchOptions};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::FetchConfig;
use crate::error::Result;

/// Failure of a delegate call. Only a plain message crosses the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct DelegateError {
    pub message: String,
}

impl DelegateError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for DelegateError {
    fn from(err: reqwest::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// A host-side capability callable from sandboxed code.
#[async_trait]
pub trait HostDelegate: Send + Sync {
    /// Capability name, also the key the shim passes when calling the host
    fn name(&self) -> &str;

    /// JavaScript function expression installed in every context.
    ///
    /// It is called as `shim(invoke, global)` where `invoke(args)` returns a
    /// promise for the delegate's copied result.
    fn shim(&self) -> &str;

    /// Perform the privileged operation with copied arguments.
    async fn call(&self, args: Value) -> std::result::Result<Value, DelegateError>;
}

/// The capabilities granted to plugins, keyed by name.
#[derive(Clone, Default)]
pub struct DelegateSet {
    delegates: BTreeMap<String, Arc<dyn HostDelegate>>,
}

impl DelegateSet {
    /// An empty set: plugins get no capabilities beyond `console`.
    pub fn new() -> Self {
        Self::default()
    }

    /// The default set containing only the network fetch capability.
    pub fn with_fetch(config: &FetchConfig) -> Result<Self> {
        let fetch = FetchDelegate::new(config.clone())?;
        Ok(Self::new().with(Arc::new(fetch)))
    }

    /// Add (or replace) a delegate.
    pub fn with(mut self, delegate: Arc<dyn HostDelegate>) -> Self {
        self.delegates.insert(delegate.name().to_string(), delegate);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn HostDelegate>> {
        self.delegates.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn HostDelegate>> {
        self.delegates.values()
    }

    pub fn is_empty(&self) -> bool {
        self.delegates.is_empty()
    }

    /// Route a call from the sandbox to the named delegate.
    pub async fn dispatch(
        &self,
        name: &str,
        args: Value,
    ) -> std::result::Result<Value, DelegateError> {
        let Some(delegate) = self.delegates.get(name) else {
            warn!(capability = %name, "Sandbox requested unknown capability");
            return Err(DelegateError::new(format!(
                "capability '{}' is not available",
                name
            )));
        };

        debug!(capability = %name, "Dispatching delegate call");
        let result = delegate.call(args).await;
        if let Err(ref e) = result {
            warn!(capability = %name, error = %e, "Delegate call failed");
        }
        result
    }
}

impl fmt::Debug for DelegateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.delegates.keys()).finish()
    }
}
