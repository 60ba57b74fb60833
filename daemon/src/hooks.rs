use std::collections::HashMap;
use std::net::SocketAddr;

/// Lifecycle points the server loop announces. The set is closed: hooks are
/// an integration seam (connection auditing, tests), not a plugin system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerHook {
    StartupPre,
    StartupPost,
    PreAccept,
    PostAccept,
    ShutdownPre,
    ShutdownPost,
}

#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub client_addr: Option<SocketAddr>,
}

type Listener = Box<dyn Fn(ServerHook, &HookContext) + Send + Sync>;

/// Maps each hook tag to an ordered list of listeners, invoked synchronously
/// in registration order.
#[derive(Default)]
pub struct HookRegistry {
    listeners: HashMap<ServerHook, Vec<Listener>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, hook: ServerHook, callback: F)
    where
        F: Fn(ServerHook, &HookContext) + Send + Sync + 'static,
    {
        self.listeners
            .entry(hook)
            .or_default()
            .push(Box::new(callback));
    }

    pub fn run(&self, hook: ServerHook, ctx: &HookContext) {
        if let Some(listeners) = self.listeners.get(&hook) {
            log::debug!(
                "Hook {:?} has {} listener(s), running callbacks...",
                hook,
                listeners.len()
            );
            for listener in listeners {
                listener(hook, ctx);
            }
        }
    }
}
