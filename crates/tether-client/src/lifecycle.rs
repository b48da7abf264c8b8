//! Process shutdown hooks.
//!
//! The composing application owns one [`Lifecycle`] and calls
//! [`Lifecycle::shutdown`] when the process is about to exit. Clients
//! register a hook on construction (save the identity store, release the
//! directory lock) and deregister it when they are dropped, so a hook never
//! outlives its client.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

type Hook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Hooks {
    next_id: AtomicU64,
    registered: Mutex<Vec<(u64, Hook)>>,
    shut_down: AtomicBool,
}

/// The set of hooks to run at shutdown.
#[derive(Default, Clone)]
pub struct Lifecycle {
    hooks: Arc<Hooks>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `hook`. It stays registered until the returned handle is
    /// dropped.
    pub fn register(&self, hook: impl Fn() + Send + Sync + 'static) -> HookHandle {
        let id = self.hooks.next_id.fetch_add(1, Ordering::Relaxed);
        self.hooks.registered.lock().push((id, Box::new(hook)));
        HookHandle {
            id,
            hooks: Arc::clone(&self.hooks),
        }
    }

    /// Runs every registered hook once. Later calls do nothing.
    pub fn shutdown(&self) {
        if self.hooks.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let hooks = std::mem::take(&mut *self.hooks.registered.lock());
        tracing::info!(hooks = hooks.len(), "running shutdown hooks");
        for (_, hook) in hooks {
            hook();
        }
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.registered.lock().len()
    }
}

/// Deregisters its hook when dropped.
pub struct HookHandle {
    id: u64,
    hooks: Arc<Hooks>,
}

impl Drop for HookHandle {
    fn drop(&mut self) {
        self.hooks.registered.lock().retain(|(id, _)| *id != self.id);
    }
}
