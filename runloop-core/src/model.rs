//! Opaque model and optimizer handles.
//!
//! The runner never looks inside a model. It only needs to snapshot and restore
//! state for checkpoints; the optimizer additionally exposes its learning rate
//! and step so the standard hooks can drive it.

use serde_json::Value;

/// Anything whose state can be captured into and restored from a checkpoint.
pub trait Model {
    fn state_dict(&self) -> Result<Value, serde_json::Error>;

    fn load_state_dict(&mut self, state: Value) -> Result<(), serde_json::Error>;
}

/// Optimizer handle driven by the learning-rate and optimizer hooks.
pub trait Optimizer: Model {
    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    /// Apply accumulated updates.
    fn step(&mut self) -> anyhow::Result<()>;

    fn zero_grad(&mut self);
}

impl Model for () {
    fn state_dict(&self) -> Result<Value, serde_json::Error> {
        Ok(Value::Null)
    }

    fn load_state_dict(&mut self, _state: Value) -> Result<(), serde_json::Error> {
        Ok(())
    }
}
