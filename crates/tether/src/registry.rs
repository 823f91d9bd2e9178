//! The call/task registry shared by both ends of a channel.
//!
//! A [`Protocol`] maps registered names to handlers that reconstruct the
//! typed payload, execute it, and encode the result. Only the name and the
//! serialized arguments cross the wire, so both ends must register the same
//! set of types; submitting anything unregistered is rejected synchronously
//! at the call site.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::channel::ChannelContext;

/// A named remote call with a typed result.
///
/// The receiving side reconstructs the value from its serialized arguments
/// and invokes [`call`](RemoteCall::call) on one of the channel's worker
/// tasks. The [`ChannelContext`] lets a call publish events back through the
/// channel that delivered it.
pub trait RemoteCall: Serialize + DeserializeOwned + Send + 'static {
    /// Registry key; must match on both ends of the channel.
    const NAME: &'static str;

    type Output: Serialize + DeserializeOwned + Send + 'static;

    fn call(&self, ctx: &ChannelContext) -> anyhow::Result<Self::Output>;
}

/// Fire-and-forget flavor of [`RemoteCall`].
pub trait RemoteTask: Serialize + DeserializeOwned + Send + 'static {
    /// Registry key; must match on both ends of the channel.
    const NAME: &'static str;

    fn run(&self, ctx: &ChannelContext) -> anyhow::Result<()>;
}

pub(crate) type CallHandler =
    Arc<dyn Fn(Value, &ChannelContext) -> Result<Value, String> + Send + Sync>;
pub(crate) type TaskHandler =
    Arc<dyn Fn(Value, &ChannelContext) -> Result<(), String> + Send + Sync>;

/// The set of operations a channel understands.
#[derive(Clone, Default)]
pub struct Protocol {
    calls: HashMap<String, CallHandler>,
    tasks: HashMap<String, TaskHandler>,
}

impl Protocol {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_call<C: RemoteCall>(mut self) -> Self {
        self.calls.insert(
            C::NAME.to_string(),
            Arc::new(|args, ctx| {
                let call: C = serde_json::from_value(args)
                    .map_err(|e| format!("invalid arguments for '{}': {e}", C::NAME))?;
                let output = call.call(ctx).map_err(|e| format!("{e:#}"))?;
                serde_json::to_value(output)
                    .map_err(|e| format!("unencodable result from '{}': {e}", C::NAME))
            }),
        );
        self
    }

    pub fn register_task<T: RemoteTask>(mut self) -> Self {
        self.tasks.insert(
            T::NAME.to_string(),
            Arc::new(|args, ctx| {
                let task: T = serde_json::from_value(args)
                    .map_err(|e| format!("invalid arguments for '{}': {e}", T::NAME))?;
                task.run(ctx).map_err(|e| format!("{e:#}"))
            }),
        );
        self
    }

    pub fn has_call(&self, name: &str) -> bool {
        self.calls.contains_key(name)
    }

    pub fn has_task(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub(crate) fn call_handler(&self, name: &str) -> Option<CallHandler> {
        self.calls.get(name).cloned()
    }

    pub(crate) fn task_handler(&self, name: &str) -> Option<TaskHandler> {
        self.tasks.get(name).cloned()
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("calls", &self.calls.keys().collect::<Vec<_>>())
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}
