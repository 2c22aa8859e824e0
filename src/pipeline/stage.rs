//! Stage topology and the model contract for pipeline generation.

use crate::error::{Error, Result};
use numr::runtime::{Communicator, Runtime};
use numr::tensor::Tensor;

/// Per-layer key/value cache carried across decode steps.
pub type KvCache<R> = Vec<(Tensor<R>, Tensor<R>)>;

/// Position of this rank in the pipeline ring.
///
/// The embedding and LM head share the first stage's device (tied weights),
/// so hidden states flow in a ring: the last stage's output returns to the
/// first stage for decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTopology {
    num_stages: usize,
    stage: usize,
}

impl StageTopology {
    pub fn new(num_stages: usize, stage: usize) -> Result<Self> {
        if num_stages == 0 || stage >= num_stages {
            return Err(Error::Config {
                reason: format!("invalid stage {stage} for {num_stages}-stage pipeline"),
            });
        }
        Ok(Self { num_stages, stage })
    }

    /// Topology from a pipeline process group: rank is the stage index.
    pub fn from_communicator(comm: &dyn Communicator) -> Result<Self> {
        Self::new(comm.world_size(), comm.rank())
    }

    pub fn num_stages(&self) -> usize {
        self.num_stages
    }

    pub fn stage(&self) -> usize {
        self.stage
    }

    pub fn is_first_stage(&self) -> bool {
        self.stage == 0
    }

    pub fn is_last_stage(&self) -> bool {
        self.stage == self.num_stages - 1
    }

    /// Upstream neighbor in the ring (the last stage feeds the first).
    pub fn prev_rank(&self) -> usize {
        (self.stage + self.num_stages - 1) % self.num_stages
    }

    /// Downstream neighbor in the ring.
    pub fn next_rank(&self) -> usize {
        (self.stage + 1) % self.num_stages
    }
}

/// Typed input to a stage forward pass.
///
/// Exactly the fields a phase needs are populated: prefill carries tokens and
/// mask, decode re-encoding adds the kv cache, body stages carry upstream
/// hidden states plus their cached kv.
pub struct StageInput<R: Runtime> {
    pub input_ids: Option<Tensor<R>>,
    pub attn_mask: Option<Tensor<R>>,
    pub kv_cache: Option<KvCache<R>>,
    pub hidden_states: Option<Tensor<R>>,
}

impl<R: Runtime> Default for StageInput<R> {
    fn default() -> Self {
        Self {
            input_ids: None,
            attn_mask: None,
            kv_cache: None,
            hidden_states: None,
        }
    }
}

impl<R: Runtime> StageInput<R> {
    /// Full-sequence prefill on the first stage.
    pub fn prefill(input_ids: Tensor<R>, attn_mask: Tensor<R>) -> Self {
        Self {
            input_ids: Some(input_ids),
            attn_mask: Some(attn_mask),
            kv_cache: None,
            hidden_states: None,
        }
    }

    /// Single-token re-encoding on the first stage.
    pub fn decode(input_ids: Tensor<R>, attn_mask: Tensor<R>, kv_cache: Option<KvCache<R>>) -> Self {
        Self {
            input_ids: Some(input_ids),
            attn_mask: Some(attn_mask),
            kv_cache,
            hidden_states: None,
        }
    }

    /// Head decode from the last stage's hidden states (logits path).
    pub fn from_hidden(hidden_states: Tensor<R>) -> Self {
        Self {
            input_ids: None,
            attn_mask: None,
            kv_cache: None,
            hidden_states: Some(hidden_states),
        }
    }

    /// Body-stage forward with upstream hidden states and cached kv.
    pub fn body(hidden_states: Tensor<R>, kv_cache: Option<KvCache<R>>) -> Self {
        Self {
            input_ids: None,
            attn_mask: None,
            kv_cache,
            hidden_states: Some(hidden_states),
        }
    }
}

/// Typed output of a stage forward pass.
///
/// Non-final positions produce `hidden_states`; the first stage's decode path
/// produces `logits`. The updated kv cache rides along for the microbatch
/// manager to store.
pub struct StageOutput<R: Runtime> {
    pub hidden_states: Option<Tensor<R>>,
    pub logits: Option<Tensor<R>>,
    pub kv_cache: Option<KvCache<R>>,
}

impl<R: Runtime> Default for StageOutput<R> {
    fn default() -> Self {
        Self {
            hidden_states: None,
            logits: None,
            kv_cache: None,
        }
    }
}

/// One pipeline stage's share of the model.
///
/// The schedule owns the communication and phase bookkeeping; the stage only
/// maps inputs to outputs.
pub trait GenerateStage<R: Runtime>: Send {
    fn forward(&mut self, input: StageInput<R>) -> Result<StageOutput<R>>;
}
