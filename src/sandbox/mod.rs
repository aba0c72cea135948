mod backends;
mod bridge;
mod lifecycle;
mod runner;
mod traits;

pub use backends::{QuickJsContext, QuickJsEngine};
pub use bridge::{channel, DelegateCall, DelegateRef, DelegateReply, HostEndpoint, SandboxEndpoint};
pub use lifecycle::{run_in_context, ContextGuard, ContextRegistry, LifecycleState, LiveContext};
pub use runner::{PluginOutcome, PluginRunner};
pub use traits::{ContextBinding, SandboxContext, SandboxEngine, SandboxLimits};
