//! Parameter shard registry: ownership, reduction flags, flat fp16 buffers.

use std::collections::HashMap;

use super::BaseStore;
use crate::error::{Error, Result};
use crate::zero::ParamId;
use numr::runtime::{Communicator, Runtime};
use numr::tensor::Tensor;

/// Tracks which rank owns each parameter, the per-(rank, group) shard lists,
/// the flat fp16 buffers built from them, and the per-step reduction flags.
///
/// The store manages bookkeeping only — the tensors used for mixed precision
/// master weights live in the sharded optimizer.
pub struct ParameterStore<R: Runtime> {
    base: BaseStore,
    param_to_rank: HashMap<ParamId, usize>,
    reduction_state: HashMap<ParamId, bool>,
    params_by_rank_group: HashMap<(usize, usize), Vec<ParamId>>,
    flat_by_rank_group: HashMap<(usize, usize), Tensor<R>>,
}

impl<R: Runtime> ParameterStore<R> {
    pub fn new(comm: &dyn Communicator) -> Self {
        Self {
            base: BaseStore::new(comm),
            param_to_rank: HashMap::new(),
            reduction_state: HashMap::new(),
            params_by_rank_group: HashMap::new(),
            flat_by_rank_group: HashMap::new(),
        }
    }

    /// Record the owning rank of a parameter. Exactly one rank owns each
    /// parameter; re-assigning is an accounting error.
    pub fn set_param_to_rank(&mut self, param_id: ParamId, rank: usize) -> Result<()> {
        if self.param_to_rank.insert(param_id, rank).is_some() {
            return Err(Error::Accounting {
                reason: format!("{param_id} assigned to more than one rank"),
            });
        }
        Ok(())
    }

    /// The rank owning `param_id`.
    pub fn owner_of(&self, param_id: ParamId) -> Result<usize> {
        self.param_to_rank
            .get(&param_id)
            .copied()
            .ok_or_else(|| Error::Accounting {
                reason: format!("{param_id} was never assigned to a rank"),
            })
    }

    /// Whether this rank owns `param_id` for optimizer-state purposes.
    pub fn belongs_to_current_rank(&self, param_id: ParamId) -> bool {
        self.param_to_rank.get(&param_id) == Some(&self.base.local_rank)
    }

    pub fn set_param_reduction_state(&mut self, param_id: ParamId, reduced: bool) {
        self.reduction_state.insert(param_id, reduced);
    }

    /// Whether the parameter's gradient has already been reduced this step.
    pub fn is_param_reduced(&self, param_id: ParamId) -> bool {
        self.reduction_state.get(&param_id).copied().unwrap_or(false)
    }

    /// Clear every reduction flag for the next step window.
    pub fn reset_reduction_states(&mut self) {
        for state in self.reduction_state.values_mut() {
            *state = false;
        }
    }

    /// Register the ordered shard list of `rank` within `group_id`.
    pub fn add_param_list_by_rank_group(
        &mut self,
        rank: usize,
        group_id: usize,
        params: Vec<ParamId>,
    ) {
        self.params_by_rank_group.insert((rank, group_id), params);
    }

    /// The ordered shard list of `rank` within `group_id` (empty if none).
    pub fn params_by_rank_group(&self, rank: usize, group_id: usize) -> &[ParamId] {
        self.params_by_rank_group
            .get(&(rank, group_id))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Store the flat fp16 buffer holding `rank`'s shard of `group_id`.
    pub fn set_flat_param_by_rank_group(&mut self, rank: usize, group_id: usize, flat: Tensor<R>) {
        self.flat_by_rank_group.insert((rank, group_id), flat);
    }

    pub fn flat_param_by_rank_group(&self, rank: usize, group_id: usize) -> Result<&Tensor<R>> {
        self.flat_by_rank_group
            .get(&(rank, group_id))
            .ok_or_else(|| Error::Accounting {
                reason: format!("no flat buffer recorded for rank {rank}, group {group_id}"),
            })
    }

    pub fn local_rank(&self) -> usize {
        self.base.local_rank
    }

    pub fn world_size(&self) -> usize {
        self.base.world_size
    }
}
