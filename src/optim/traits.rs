//! Inner optimizer contract consumed by the sharded optimizer.
//!
//! The sharded optimizer never exposes individual model parameters to the
//! inner optimizer — each parameter group is collapsed into one contiguous
//! fp32 master buffer, and the inner optimizer steps those buffers only.

use crate::error::Result;
use numr::dtype::DType;
use numr::ops::{BinaryOps, ScalarOps, UnaryOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// One parameter group's rank-local flat fp32 state for a single step.
///
/// `param` is replaced by the optimizer with the updated buffer; `grad` is the
/// already unscaled/clipped flat gradient with the same number of elements.
pub struct FlatPartition<R: Runtime> {
    /// Flat fp32 master parameters of this rank's shard.
    pub param: Tensor<R>,
    /// Flat fp32 gradient for the shard.
    pub grad: Tensor<R>,
}

/// An optimizer stepping rank-local flat partitions, one per parameter group.
///
/// Internal state (moments, counters) is keyed by the partition's position in
/// the slice, which is stable across steps: partitions are always passed in
/// group order.
pub trait PartitionOptimizer<R: Runtime<DType = DType>> {
    /// Apply one update to every partition in place.
    fn step<C>(&mut self, client: &C, partitions: &mut [FlatPartition<R>]) -> Result<()>
    where
        C: RuntimeClient<R> + BinaryOps<R> + UnaryOps<R> + ScalarOps<R>;

    /// Number of completed optimizer steps.
    fn timestep(&self) -> u64;

    /// Current learning rate.
    fn lr(&self) -> f64;

    /// Set learning rate.
    fn set_lr(&mut self, lr: f64);
}
