//! Ordered hook registration and fail-fast dispatch.

use tracing::{debug, warn};

use super::{Hook, HookContext, HookEvent, Priority};
use crate::error::DispatchError;

struct Entry {
    priority: Priority,
    seq: u64,
    hook: Box<dyn Hook>,
}

/// Hooks sorted by `(priority, registration order)`.
#[derive(Default)]
pub struct HookRegistry {
    entries: Vec<Entry>,
    next_seq: u64,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook. Its priority is read once, here.
    pub fn register(&mut self, hook: Box<dyn Hook>) {
        let priority = hook.priority();
        debug!(
            hook = hook.name(),
            priority = priority.value(),
            "Registered hook"
        );
        self.entries.push(Entry {
            priority,
            seq: self.next_seq,
            hook,
        });
        self.next_seq += 1;
        self.entries.sort_by_key(|e| (e.priority, e.seq));
    }

    /// Invoke `event` on every hook in order.
    ///
    /// The first failing hook stops dispatch; hooks after it are not called.
    pub fn dispatch(
        &mut self,
        event: HookEvent,
        ctx: &mut HookContext<'_>,
    ) -> Result<(), DispatchError> {
        for entry in &mut self.entries {
            if let Err(source) = entry.hook.on_event(event, ctx) {
                warn!(hook = entry.hook.name(), %event, error = %source, "Hook failed");
                return Err(DispatchError {
                    hook: entry.hook.name().to_string(),
                    event,
                    source,
                });
            }
        }
        Ok(())
    }

    /// Hook names in dispatch order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.hook.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
