//! AdamW over flat master partitions
//!
//! Decoupled weight decay (Loshchilov & Hutter, 2019) applied to one flat
//! fp32 buffer per parameter group. Composed from numr primitives so it runs
//! unchanged on any backend.

use crate::error::Result;
use crate::optim::traits::{FlatPartition, PartitionOptimizer};
use numr::dtype::DType;
use numr::ops::{BinaryOps, ScalarOps, UnaryOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// FlatAdamW configuration
#[derive(Debug, Clone)]
pub struct FlatAdamWConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for FlatAdamWConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

/// Per-partition moment estimates
struct MomentState<R: Runtime> {
    m: Tensor<R>,
    v: Tensor<R>,
}

/// AdamW stepping flat fp32 partitions.
///
/// Moment state is lazily initialized per partition on the first `step()`.
pub struct FlatAdamW<R: Runtime> {
    config: FlatAdamWConfig,
    state: Vec<Option<MomentState<R>>>,
    timestep: u64,
}

impl<R: Runtime<DType = DType>> FlatAdamW<R> {
    pub fn new(config: FlatAdamWConfig) -> Self {
        Self {
            config,
            state: Vec::new(),
            timestep: 0,
        }
    }

    pub fn config(&self) -> &FlatAdamWConfig {
        &self.config
    }
}

impl<R: Runtime<DType = DType>> PartitionOptimizer<R> for FlatAdamW<R> {
    fn step<C>(&mut self, client: &C, partitions: &mut [FlatPartition<R>]) -> Result<()>
    where
        C: RuntimeClient<R> + BinaryOps<R> + UnaryOps<R> + ScalarOps<R>,
    {
        self.timestep += 1;
        let t = self.timestep as i32;

        let FlatAdamWConfig {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.config;

        // Bias-corrected step size: lr * sqrt(1 - beta2^t) / (1 - beta1^t)
        let bc1 = 1.0 - beta1.powi(t);
        let bc2 = 1.0 - beta2.powi(t);
        let step_size = lr * bc2.sqrt() / bc1;

        while self.state.len() < partitions.len() {
            self.state.push(None);
        }

        for (idx, partition) in partitions.iter_mut().enumerate() {
            let grad = &partition.grad;

            let state = self.state[idx].get_or_insert_with(|| MomentState {
                m: Tensor::<R>::zeros(grad.shape(), grad.dtype(), grad.device()),
                v: Tensor::<R>::zeros(grad.shape(), grad.dtype(), grad.device()),
            });

            // m = beta1 * m + (1 - beta1) * g
            let m = client.add(
                &client.mul_scalar(&state.m, beta1)?,
                &client.mul_scalar(grad, 1.0 - beta1)?,
            )?;
            // v = beta2 * v + (1 - beta2) * g^2
            let g_sq = client.mul(grad, grad)?;
            let v = client.add(
                &client.mul_scalar(&state.v, beta2)?,
                &client.mul_scalar(&g_sq, 1.0 - beta2)?,
            )?;

            // update = m / (sqrt(v) + eps)
            let denom = client.add_scalar(&client.sqrt(&v)?, eps)?;
            let update = client.div(&m, &denom)?;

            // Decoupled weight decay, then the Adam update
            let decayed = client.mul_scalar(&partition.param, 1.0 - lr * weight_decay)?;
            partition.param = client.sub(&decayed, &client.mul_scalar(&update, step_size)?)?;

            state.m = m;
            state.v = v;
        }

        Ok(())
    }

    fn timestep(&self) -> u64 {
        self.timestep
    }

    fn lr(&self) -> f64 {
        self.config.lr
    }

    fn set_lr(&mut self, lr: f64) {
        self.config.lr = lr;
    }
}
