//! Builds hooks from configuration specs.
//!
//! A spec names a registered hook type and carries that type's settings as
//! sibling fields. Builtin types are registered up front; user hooks are added
//! with [`HookFactory::register`].

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{ConfigError, HookResult};
use crate::hooks::{
    CheckpointConfig, CheckpointHook, Hook, HookContext, HookEvent, LogConfig, LrConfig,
    LrSchedulerHook, OptimizerHook, OptimizerHookConfig, Priority, SamplerSeedConfig,
    SamplerSeedHook, TextLoggerHook,
};

/// `{ "type": "...", "priority": ..., ...fields }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookSpec {
    #[serde(rename = "type")]
    pub kind: String,
    /// Overrides the hook's own priority when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl HookSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            priority: None,
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn with_priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = Some(priority.into());
        self
    }
}

/// Builds a hook from the spec's fields.
pub type HookCtor = Box<dyn Fn(&Value) -> Result<Box<dyn Hook>, ConfigError>>;

/// Explicit registry of hook type name to constructor.
pub struct HookFactory {
    ctors: BTreeMap<String, HookCtor>,
}

impl HookFactory {
    /// A factory with no types registered.
    pub fn new() -> Self {
        Self {
            ctors: BTreeMap::new(),
        }
    }

    /// A factory with every standard hook registered.
    pub fn with_builtins() -> Self {
        let mut factory = Self::new();
        factory.insert("CheckpointHook", |fields| {
            let config: CheckpointConfig = parse("CheckpointHook", fields)?;
            Ok(Box::new(CheckpointHook::new(config)?))
        });
        factory.insert("LrSchedulerHook", |fields| {
            let config: LrConfig = parse("LrSchedulerHook", fields)?;
            Ok(Box::new(LrSchedulerHook::new(config)?))
        });
        factory.insert("OptimizerHook", |fields| {
            let config: OptimizerHookConfig = parse("OptimizerHook", fields)?;
            Ok(Box::new(OptimizerHook::new(config)))
        });
        factory.insert("TextLoggerHook", |fields| {
            let config: LogConfig = parse("TextLoggerHook", fields)?;
            Ok(Box::new(TextLoggerHook::new(config)?))
        });
        factory.insert("SamplerSeedHook", |fields| {
            let config: SamplerSeedConfig = parse("SamplerSeedHook", fields)?;
            Ok(Box::new(SamplerSeedHook::new(config)))
        });
        factory
    }

    fn insert(
        &mut self,
        name: &str,
        ctor: impl Fn(&Value) -> Result<Box<dyn Hook>, ConfigError> + 'static,
    ) {
        self.ctors.insert(name.to_string(), Box::new(ctor));
    }

    /// Register a constructor. Fails if `name` is already taken.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        ctor: impl Fn(&Value) -> Result<Box<dyn Hook>, ConfigError> + 'static,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        if self.ctors.contains_key(&name) {
            return Err(ConfigError::InvalidSpec {
                name,
                message: "hook type is already registered".to_string(),
            });
        }
        debug!(hook_type = %name, "Registering hook type");
        self.ctors.insert(name, Box::new(ctor));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ctors.contains_key(name)
    }

    /// Registered type names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.ctors.keys().map(String::as_str).collect()
    }

    /// Construct the hook a spec describes.
    pub fn build(&self, spec: &HookSpec) -> Result<Box<dyn Hook>, ConfigError> {
        let ctor = self
            .ctors
            .get(&spec.kind)
            .ok_or_else(|| ConfigError::UnknownType {
                kind: "hook",
                name: spec.kind.clone(),
            })?;
        let hook = ctor(&Value::Object(spec.fields.clone()))?;
        debug!(hook_type = %spec.kind, hook = hook.name(), "Built hook from spec");
        Ok(match spec.priority {
            Some(priority) => Box::new(Reprioritized { inner: hook, priority }),
            None => hook,
        })
    }
}

impl Default for HookFactory {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for HookFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookFactory")
            .field("types", &self.names())
            .finish()
    }
}

/// Deserialize a spec's fields into a hook config.
pub fn parse<T: DeserializeOwned>(kind: &str, fields: &Value) -> Result<T, ConfigError> {
    serde_json::from_value(fields.clone()).map_err(|e| ConfigError::InvalidSpec {
        name: kind.to_string(),
        message: e.to_string(),
    })
}

/// A hook whose priority was overridden by its spec.
struct Reprioritized {
    inner: Box<dyn Hook>,
    priority: Priority,
}

impl Hook for Reprioritized {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn on_event(&mut self, event: HookEvent, ctx: &mut HookContext<'_>) -> HookResult {
        self.inner.on_event(event, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::CallbackHook;
    use serde_json::json;

    #[test]
    fn test_builtins_registered() {
        let factory = HookFactory::with_builtins();
        assert_eq!(
            factory.names(),
            vec![
                "CheckpointHook",
                "LrSchedulerHook",
                "OptimizerHook",
                "SamplerSeedHook",
                "TextLoggerHook"
            ]
        );
    }

    #[test]
    fn test_build_checkpoint_from_spec() {
        let spec: HookSpec = serde_json::from_value(json!({
            "type": "CheckpointHook",
            "metric_name": "acc",
            "mode": "max",
            "num_checkpoints": 3
        }))
        .unwrap();
        let hook = HookFactory::with_builtins().build(&spec).unwrap();
        assert_eq!(hook.name(), "checkpoint");
        assert_eq!(hook.priority(), Priority::Lowest);
    }

    /// `Box<dyn Hook>` is not `Debug`, so `unwrap_err` is unavailable.
    fn build_err(factory: &HookFactory, spec: &HookSpec) -> ConfigError {
        match factory.build(spec) {
            Ok(hook) => panic!("expected an error, built hook '{}'", hook.name()),
            Err(e) => e,
        }
    }

    #[test]
    fn test_unknown_type() {
        let err = build_err(&HookFactory::with_builtins(), &HookSpec::new("EmaHook"));
        assert!(matches!(err, ConfigError::UnknownType { kind: "hook", ref name } if name == "EmaHook"));
    }

    #[test]
    fn test_bad_fields_are_invalid_spec() {
        let factory = HookFactory::with_builtins();
        let spec = HookSpec::new("CheckpointHook").with_field("metric_name", json!("acc"));
        assert!(matches!(build_err(&factory, &spec), ConfigError::InvalidSpec { .. }));

        let spec = HookSpec::new("TextLoggerHook").with_field("interval", json!(0));
        assert!(matches!(build_err(&factory, &spec), ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_priority_override() {
        let spec = HookSpec::new("SamplerSeedHook").with_priority(Priority::Highest);
        let hook = HookFactory::with_builtins().build(&spec).unwrap();
        assert_eq!(hook.priority(), Priority::Highest);
        assert_eq!(hook.name(), "sampler_seed");
    }

    #[test]
    fn test_user_registration() {
        let mut factory = HookFactory::new();
        factory
            .register("Probe", |fields| {
                let name = fields["name"].as_str().unwrap_or("probe").to_string();
                Ok(Box::new(CallbackHook::new(name)))
            })
            .unwrap();
        assert!(factory.register("Probe", |_| Ok(Box::new(CallbackHook::new("x")))).is_err());

        let hook = factory
            .build(&HookSpec::new("Probe").with_field("name", json!("custom")))
            .unwrap();
        assert_eq!(hook.name(), "custom");
    }
}
