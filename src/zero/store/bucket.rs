//! Fixed-capacity communication bucket for gradient reduction.

use super::BaseStore;
use crate::error::{Error, Result};
use crate::zero::ParamId;
use numr::dtype::DType;
use numr::ops::TensorOps;
use numr::runtime::{Communicator, Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// A gradient waiting in the bucket, together with its zero-padding
/// requirement. The bucket owns the tensor: nothing else retains the
/// parameter's gradient once it is handed in, which is the memory-saving
/// contract of bucketed reduction.
struct PendingGrad<R: Runtime> {
    param_id: ParamId,
    grad: Tensor<R>,
    padding: usize,
}

/// Accumulates gradients into a size-bounded bucket, then pads, splits, and
/// flattens them for one collective reduction.
///
/// The element counter includes padding and is maintained incrementally;
/// [`reset`](BucketStore::reset) must be called after every reduction round
/// or the counter and slice mapping go stale.
pub struct BucketStore<R: Runtime> {
    base: BaseStore,
    current_group_id: usize,
    num_elements_in_bucket: usize,
    pending: Vec<PendingGrad<R>>,
    /// Per-rank slice lists, filled by `build_grad_in_bucket`.
    grad_in_bucket: Vec<Vec<Tensor<R>>>,
    /// Slice position → owning parameter, identical for every rank.
    slice_params: Vec<ParamId>,
    /// Per-slice element count (padded numel / world size).
    slice_sizes: Vec<usize>,
}

impl<R: Runtime<DType = DType>> BucketStore<R> {
    pub fn new(comm: &dyn Communicator) -> Self {
        let base = BaseStore::new(comm);
        Self {
            base,
            current_group_id: 0,
            num_elements_in_bucket: 0,
            pending: Vec::new(),
            grad_in_bucket: vec![Vec::new(); base.world_size],
            slice_params: Vec::new(),
            slice_sizes: Vec::new(),
        }
    }

    /// Total elements currently in the bucket, padding included.
    pub fn num_elements_in_bucket(&self) -> usize {
        self.num_elements_in_bucket
    }

    /// Group of the most recently added parameter.
    pub fn current_group_id(&self) -> usize {
        self.current_group_id
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.slice_params.is_empty()
    }

    /// Hand a parameter's gradient into the bucket.
    ///
    /// Takes ownership of the gradient tensor and records the padding needed
    /// to make it divisible by the world size. Bookkeeping only — no
    /// communication is triggered here.
    pub fn add_param_grad(
        &mut self,
        group_id: usize,
        param_id: ParamId,
        grad: Tensor<R>,
        padding: usize,
    ) {
        self.num_elements_in_bucket += grad.numel() + padding;
        self.current_group_id = group_id;
        self.pending.push(PendingGrad {
            param_id,
            grad,
            padding,
        });
    }

    /// Pad and split every pending gradient into `world_size` equal slices.
    ///
    /// Records the slice→parameter mapping and releases the original
    /// gradients: after this call the bucket's slices are the only copies.
    pub fn build_grad_in_bucket<C>(&mut self, client: &C) -> Result<()>
    where
        C: RuntimeClient<R> + TensorOps<R>,
    {
        let world_size = self.base.world_size;

        for entry in self.pending.drain(..) {
            let flat = entry.grad.flatten()?;
            let padded = if entry.padding > 0 {
                let zeros =
                    Tensor::<R>::zeros(&[entry.padding], flat.dtype(), flat.device());
                client.cat(&[&flat, &zeros], 0)?
            } else {
                flat
            };

            let total = padded.numel();
            if total % world_size != 0 {
                return Err(Error::Accounting {
                    reason: format!(
                        "{} padded to {total} elements, not divisible by world size {world_size}",
                        entry.param_id
                    ),
                });
            }
            let slice_len = total / world_size;

            for (rank, slices) in self.grad_in_bucket.iter_mut().enumerate() {
                slices.push(padded.narrow(0, rank * slice_len, slice_len)?);
            }
            self.slice_params.push(entry.param_id);
            self.slice_sizes.push(slice_len);
        }

        Ok(())
    }

    /// Per-rank slice lists built by [`build_grad_in_bucket`].
    pub fn get_grad(&self) -> &[Vec<Tensor<R>>] {
        &self.grad_in_bucket
    }

    /// One flat tensor holding every slice in rank-major order:
    /// `[p0_r0, p1_r0, …, p0_r1, p1_r1, …]`.
    ///
    /// Every rank iterates the same parameter list, so this concatenation
    /// order is identical across ranks — the precondition for the collective
    /// reduction to be element-wise meaningful.
    pub fn get_flatten_grad<C>(&self, client: &C) -> Result<Tensor<R>>
    where
        C: RuntimeClient<R> + TensorOps<R>,
    {
        let mut refs: Vec<&Tensor<R>> = Vec::with_capacity(self.slice_params.len() * self.base.world_size);
        for rank_slices in &self.grad_in_bucket {
            refs.extend(rank_slices.iter());
        }
        if refs.is_empty() {
            return Err(Error::Accounting {
                reason: "get_flatten_grad called on an empty bucket".to_string(),
            });
        }
        Ok(client.cat(&refs, 0)?)
    }

    /// The parameter a slice position belongs to.
    pub fn param_id_of_slice(&self, slice_idx: usize) -> Result<ParamId> {
        self.slice_params
            .get(slice_idx)
            .copied()
            .ok_or_else(|| Error::Accounting {
                reason: format!("no slice at index {slice_idx} in bucket"),
            })
    }

    /// Parameters whose slices are in the bucket, in slice order.
    pub fn slice_params(&self) -> &[ParamId] {
        &self.slice_params
    }

    /// Per-slice element counts, in slice order.
    pub fn slice_sizes(&self) -> &[usize] {
        &self.slice_sizes
    }

    /// Clear all buffers for the next reduction round. Idempotent.
    pub fn reset(&mut self) {
        self.num_elements_in_bucket = 0;
        self.pending.clear();
        for slices in &mut self.grad_in_bucket {
            slices.clear();
        }
        self.slice_params.clear();
        self.slice_sizes.clear();
    }

    pub fn world_size(&self) -> usize {
        self.base.world_size
    }
}
