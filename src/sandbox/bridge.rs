//! Channels connecting a sandbox thread to the host task that owns the
//! delegates.
//!
//! The sandbox side holds a [`DelegateRef`]: calls flow to the host over an
//! unbounded tokio channel, replies come back over a std channel the sandbox
//! thread blocks on between event-loop turns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::delegate::DelegateError;
use crate::error::{PlugletError, Result};

/// A delegate call issued by sandboxed code, arguments already copied.
#[derive(Debug)]
pub struct DelegateCall {
    pub call_id: u32,
    pub capability: String,
    pub args: Value,
}

/// The host's answer: copied result JSON or a plain error message.
#[derive(Debug)]
pub struct DelegateReply {
    pub call_id: u32,
    pub result: std::result::Result<String, DelegateError>,
}

/// Reference to the host delegate set, held by one context.
#[derive(Debug, Clone)]
pub struct DelegateRef {
    calls: mpsc::UnboundedSender<DelegateCall>,
    attached: Arc<AtomicBool>,
}

impl DelegateRef {
    pub fn invoke(&self, call: DelegateCall) -> Result<()> {
        if !self.is_attached() {
            return Err(PlugletError::DelegateDetached {
                delegate: call.capability,
            });
        }
        self.calls.send(call).map_err(|e| PlugletError::DelegateDetached {
            delegate: e.0.capability,
        })
    }

    /// Invalidate the reference. Called when the owning context is torn down.
    pub fn detach(&self) {
        self.attached.store(false, Ordering::SeqCst);
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }
}

/// Sandbox half of the bridge.
#[derive(Debug)]
pub struct SandboxEndpoint {
    pub delegates: DelegateRef,
    pub replies: std_mpsc::Receiver<DelegateReply>,
}

/// Host half of the bridge.
#[derive(Debug)]
pub struct HostEndpoint {
    pub calls: mpsc::UnboundedReceiver<DelegateCall>,
    pub replies: std_mpsc::Sender<DelegateReply>,
}

pub fn channel() -> (SandboxEndpoint, HostEndpoint) {
    let (call_tx, call_rx) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = std_mpsc::channel();

    let sandbox = SandboxEndpoint {
        delegates: DelegateRef {
            calls: call_tx,
            attached: Arc::new(AtomicBool::new(true)),
        },
        replies: reply_rx,
    };
    let host = HostEndpoint {
        calls: call_rx,
        replies: reply_tx,
    };
    (sandbox, host)
}
