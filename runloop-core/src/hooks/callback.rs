//! Closure-backed hook with one optional slot per lifecycle event.

use std::collections::HashMap;

use super::{Hook, HookContext, HookEvent, Priority};
use crate::error::HookResult;

type Slot = Box<dyn FnMut(&mut HookContext<'_>) -> HookResult>;

/// A hook assembled from closures. Events without a slot are no-ops.
pub struct CallbackHook {
    name: String,
    priority: Priority,
    slots: HashMap<HookEvent, Slot>,
}

impl CallbackHook {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: Priority::Normal,
            slots: HashMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = priority.into();
        self
    }

    /// Fill the slot for `event`, replacing any previous closure.
    pub fn on(
        mut self,
        event: HookEvent,
        f: impl FnMut(&mut HookContext<'_>) -> HookResult + 'static,
    ) -> Self {
        self.slots.insert(event, Box::new(f));
        self
    }

    pub fn implements(&self, event: HookEvent) -> bool {
        self.slots.contains_key(&event)
    }
}

impl Hook for CallbackHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn on_event(&mut self, event: HookEvent, ctx: &mut HookContext<'_>) -> HookResult {
        match self.slots.get_mut(&event) {
            Some(slot) => slot(ctx),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for CallbackHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut events: Vec<_> = self.slots.keys().copied().collect();
        events.sort();
        f.debug_struct("CallbackHook")
            .field("name", &self.name)
            .field("priority", &self.priority.value())
            .field("events", &events)
            .finish()
    }
}
