//! Persistent store of per-parameter gradient slices across a training step.

use std::collections::HashMap;

use super::BaseStore;
use crate::error::{Error, Result};
use crate::zero::ParamId;
use numr::dtype::DType;
use numr::ops::BinaryOps;
use numr::runtime::{Communicator, Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// Maps `(group_id, param_id)` to the parameter's per-rank gradient slices.
///
/// Slice lists hold one entry per rank in rank order when gradients are
/// replicated then partitioned, or a single entry (the local shard) when
/// gradients are fully partitioned; `working_index` selects the slice this
/// rank steps with.
///
/// Reset operations are explicit and must run once per optimizer step; the
/// store never garbage-collects on its own.
pub struct GradientStore<R: Runtime> {
    base: BaseStore,
    grads_of_params: HashMap<usize, HashMap<ParamId, Vec<Tensor<R>>>>,
    working_index: usize,
}

impl<R: Runtime<DType = DType>> GradientStore<R> {
    /// `partition_grad` selects the fully-partitioned convention: slice lists
    /// hold only the local shard, at index 0. Otherwise the working slice is
    /// the local rank's entry of the full per-rank list.
    pub fn new(comm: &dyn Communicator, partition_grad: bool) -> Self {
        let base = BaseStore::new(comm);
        let working_index = if partition_grad { 0 } else { base.local_rank };
        Self {
            base,
            grads_of_params: HashMap::new(),
            working_index,
        }
    }

    /// Gradient slices recorded for a parameter. Parameters with no gradient
    /// (frozen layers, layer drop) return an empty slice, not an error.
    pub fn get_partitioned_gradients_by_param_id(
        &self,
        group_id: usize,
        param_id: ParamId,
    ) -> &[Tensor<R>] {
        self.grads_of_params
            .get(&group_id)
            .and_then(|group| group.get(&param_id))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Append a gradient slice to the parameter's slice list.
    pub fn append_gradients_by_param_id(
        &mut self,
        grad: Tensor<R>,
        group_id: usize,
        param_id: ParamId,
    ) {
        self.grads_of_params
            .entry(group_id)
            .or_default()
            .entry(param_id)
            .or_default()
            .push(grad);
    }

    /// Accumulate a gradient slice onto an existing entry in place.
    ///
    /// Used across gradient-accumulation boundaries, where a later backward
    /// pass produces a new slice for an already-recorded position.
    pub fn add_gradients_by_param_id<C>(
        &mut self,
        client: &C,
        grad: &Tensor<R>,
        grad_idx: usize,
        group_id: usize,
        param_id: ParamId,
    ) -> Result<()>
    where
        C: RuntimeClient<R> + BinaryOps<R>,
    {
        let slot = self
            .grads_of_params
            .get_mut(&group_id)
            .and_then(|group| group.get_mut(&param_id))
            .and_then(|slices| slices.get_mut(grad_idx))
            .ok_or_else(|| Error::Accounting {
                reason: format!(
                    "no gradient slice at index {grad_idx} for {param_id} in group {group_id}"
                ),
            })?;
        *slot = client.add(slot, grad)?;
        Ok(())
    }

    /// The working gradient slice of every parameter in the group, ordered by
    /// registration handle.
    pub fn get_working_grads_by_group_id(&self, group_id: usize) -> Vec<Tensor<R>> {
        let Some(group) = self.grads_of_params.get(&group_id) else {
            return Vec::new();
        };
        let mut ids: Vec<ParamId> = group.keys().copied().collect();
        ids.sort_unstable();
        ids.iter()
            .filter_map(|id| {
                group
                    .get(id)
                    .and_then(|slices| slices.get(self.working_index))
                    .cloned()
            })
            .collect()
    }

    /// Number of slices currently recorded for a parameter.
    pub fn num_slices(&self, group_id: usize, param_id: ParamId) -> usize {
        self.get_partitioned_gradients_by_param_id(group_id, param_id)
            .len()
    }

    /// Drop the recorded slices of a single parameter. Idempotent.
    pub fn drop_param_gradients(&mut self, group_id: usize, param_id: ParamId) {
        if let Some(group) = self.grads_of_params.get_mut(&group_id) {
            group.remove(&param_id);
        }
    }

    /// Drop all gradients of one group. Idempotent.
    pub fn reset_grads_by_group_id(&mut self, group_id: usize) {
        self.grads_of_params.remove(&group_id);
    }

    /// Drop all gradients. Idempotent.
    pub fn reset_all_gradients(&mut self) {
        self.grads_of_params.clear();
    }

    pub fn working_index(&self) -> usize {
        self.working_index
    }

    pub fn local_rank(&self) -> usize {
        self.base.local_rank
    }
}
