//! Synthetic linear-regression workload used by `runloop train`.
//!
//! The model and its SGD optimizer share one parameter block, the way a
//! framework optimizer holds references to the model's tensors.

use std::cell::RefCell;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use runloop_core::{BatchOutput, DistContext, Mode, Model, Optimizer, ShardedSource};

/// Coefficients the synthetic targets are generated from.
const TRUE_WEIGHTS: [f64; 4] = [2.0, -3.0, 0.5, 1.0];
const TRUE_BIAS: f64 = 0.7;
const NOISE: f64 = 0.05;

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub x: Vec<[f64; 4]>,
    pub y: Vec<f64>,
}

#[derive(Debug, Default)]
struct Params {
    weights: [f64; 4],
    bias: f64,
    grad_weights: [f64; 4],
    grad_bias: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ModelState {
    weights: [f64; 4],
    bias: f64,
}

#[derive(Debug)]
pub struct LinearModel {
    params: Rc<RefCell<Params>>,
}

impl LinearModel {
    pub fn weights(&self) -> ([f64; 4], f64) {
        let p = self.params.borrow();
        (p.weights, p.bias)
    }

    fn predict(p: &Params, x: &[f64; 4]) -> f64 {
        p.weights.iter().zip(x).map(|(w, xi)| w * xi).sum::<f64>() + p.bias
    }
}

impl Model for LinearModel {
    fn state_dict(&self) -> Result<Value, serde_json::Error> {
        let p = self.params.borrow();
        serde_json::to_value(ModelState {
            weights: p.weights,
            bias: p.bias,
        })
    }

    fn load_state_dict(&mut self, state: Value) -> Result<(), serde_json::Error> {
        let state: ModelState = serde_json::from_value(state)?;
        let mut p = self.params.borrow_mut();
        p.weights = state.weights;
        p.bias = state.bias;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SgdState {
    lr: f64,
    momentum: f64,
    velocity: [f64; 5],
}

/// Plain SGD with optional momentum.
#[derive(Debug)]
pub struct Sgd {
    params: Rc<RefCell<Params>>,
    lr: f64,
    momentum: f64,
    velocity: [f64; 5],
}

impl Model for Sgd {
    fn state_dict(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(SgdState {
            lr: self.lr,
            momentum: self.momentum,
            velocity: self.velocity,
        })
    }

    fn load_state_dict(&mut self, state: Value) -> Result<(), serde_json::Error> {
        let state: SgdState = serde_json::from_value(state)?;
        self.lr = state.lr;
        self.momentum = state.momentum;
        self.velocity = state.velocity;
        Ok(())
    }
}

impl Optimizer for Sgd {
    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn step(&mut self) -> anyhow::Result<()> {
        let mut p = self.params.borrow_mut();
        let grads: Vec<f64> = p
            .grad_weights
            .iter()
            .copied()
            .chain(std::iter::once(p.grad_bias))
            .collect();
        if grads.iter().any(|g| !g.is_finite()) {
            anyhow::bail!("non-finite gradient");
        }
        for (v, g) in self.velocity.iter_mut().zip(&grads) {
            *v = self.momentum * *v + g;
        }
        for (w, v) in p.weights.iter_mut().zip(&self.velocity) {
            *w -= self.lr * v;
        }
        p.bias -= self.lr * self.velocity[4];
        Ok(())
    }

    fn zero_grad(&mut self) {
        let mut p = self.params.borrow_mut();
        p.grad_weights = [0.0; 4];
        p.grad_bias = 0.0;
    }
}

/// A zero-initialized model and an optimizer bound to its parameters.
pub fn linear_regression(lr: f64, momentum: f64) -> (LinearModel, Sgd) {
    let params = Rc::new(RefCell::new(Params::default()));
    let model = LinearModel {
        params: Rc::clone(&params),
    };
    let optimizer = Sgd {
        params,
        lr,
        momentum,
        velocity: [0.0; 5],
    };
    (model, optimizer)
}

/// Mean squared error over the batch. In train mode the gradient is
/// accumulated for the optimizer hook to apply.
pub fn process_batch(model: &mut LinearModel, batch: Batch, mode: Mode) -> anyhow::Result<BatchOutput> {
    let n = batch.y.len();
    if n == 0 {
        anyhow::bail!("empty batch");
    }
    let mut p = model.params.borrow_mut();
    let mut loss = 0.0;
    let mut grad_weights = [0.0; 4];
    let mut grad_bias = 0.0;
    for (x, y) in batch.x.iter().zip(&batch.y) {
        let err = LinearModel::predict(&p, x) - y;
        loss += err * err;
        for (g, xi) in grad_weights.iter_mut().zip(x) {
            *g += 2.0 * err * xi / n as f64;
        }
        grad_bias += 2.0 * err / n as f64;
    }
    loss /= n as f64;

    if mode == Mode::Train {
        for (acc, g) in p.grad_weights.iter_mut().zip(grad_weights) {
            *acc += g;
        }
        p.grad_bias += grad_bias;
    }

    Ok(BatchOutput::new(loss, n).with_value("loss", loss))
}

/// Deterministic train and val splits, sharded across ranks.
pub fn datasets(
    seed: u64,
    samples: usize,
    batch_size: usize,
    dist: DistContext,
) -> (ShardedSource<Batch>, ShardedSource<Batch>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let points: Vec<([f64; 4], f64)> = (0..samples)
        .map(|_| {
            let x: [f64; 4] = std::array::from_fn(|_| rng.gen_range(-1.0..1.0));
            let clean: f64 = TRUE_WEIGHTS.iter().zip(&x).map(|(w, xi)| w * xi).sum();
            (x, clean + TRUE_BIAS + rng.gen_range(-NOISE..NOISE))
        })
        .collect();

    let split = samples * 4 / 5;
    let batches = |chunk: &[([f64; 4], f64)]| -> Vec<Batch> {
        chunk
            .chunks(batch_size.max(1))
            .map(|c| Batch {
                x: c.iter().map(|(x, _)| *x).collect(),
                y: c.iter().map(|(_, y)| *y).collect(),
            })
            .collect()
    };
    let train = ShardedSource::new(batches(&points[..split]), dist).shuffled(true);
    let val = ShardedSource::new(batches(&points[split..]), dist);
    (train, val)
}
