//! Stage-aware schedule for pipeline-parallel autoregressive generation.
//!
//! Each scheduler iteration services one microbatch slot; the action set is a
//! function of (is this the first stage?, the slot's phase):
//!
//! | stage  | phase    | actions                                        |
//! |--------|----------|------------------------------------------------|
//! | first  | Prefill  | flush pending hidden, load + full forward      |
//! | first  | Generate | exchange, decode token, re-encode              |
//! | first  | Cooldown | exchange, decode final token                   |
//! | other  | any      | exchange, body forward with cached kv          |
//!
//! A round processes `buffer_size` microbatches concurrently so every stage
//! stays busy; after a round the first stage exports finished sequences and
//! all stages clear per-round state.

use std::sync::Arc;

use tracing::trace;

use crate::error::{Error, Result};
use crate::pipeline::microbatch::{MicroBatchManager, MicroBatchPhase};
use crate::pipeline::p2p::{PipelineP2p, StageEnvelope};
use crate::pipeline::stage::{GenerateStage, StageInput, StageOutput, StageTopology};
use numr::dtype::DType;
use numr::ops::{IndexingOps, TensorOps};
use numr::runtime::{Communicator, Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// Generation schedule configuration.
#[derive(Debug, Clone)]
pub struct GenerateConfig {
    /// Tokens to generate per microbatch.
    pub new_length: usize,
    /// Sequences per microbatch.
    pub micro_batch_size: usize,
    /// In-flight microbatch slots; defaults to the number of pipeline stages.
    pub micro_batch_buffer_size: Option<usize>,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            new_length: 32,
            micro_batch_size: 1,
            micro_batch_buffer_size: None,
        }
    }
}

/// One batch of prompts. Only the first stage reads the tensors; every stage
/// uses the batch dimension to size its rounds.
pub struct GenerateBatch<R: Runtime> {
    /// Token ids, `[batch, prompt_len]`, i64.
    pub input_ids: Tensor<R>,
    /// Attention mask, `[batch, prompt_len]`.
    pub attn_mask: Tensor<R>,
}

/// Drives one pipeline stage through rounds of microbatch generation.
pub struct GenerateSchedule<R: Runtime> {
    p2p: PipelineP2p<R>,
    topology: StageTopology,
    mb_manager: MicroBatchManager<R>,
    /// Hidden states produced by the previous action, awaiting the next
    /// exchange with a neighbor stage.
    interval_hidden: Option<Tensor<R>>,
    microbatch_offset: usize,
}

impl<R: Runtime<DType = DType>> GenerateSchedule<R> {
    pub fn new(
        comm: Arc<dyn Communicator>,
        device: R::Device,
        config: GenerateConfig,
    ) -> Result<Self> {
        let topology = StageTopology::from_communicator(comm.as_ref())?;
        let buffer_size = config
            .micro_batch_buffer_size
            .unwrap_or(topology.num_stages());
        let mb_manager = MicroBatchManager::new(
            topology.is_first_stage(),
            config.new_length,
            config.micro_batch_size,
            buffer_size,
        )?;
        Ok(Self {
            p2p: PipelineP2p::new(comm, topology, device),
            topology,
            mb_manager,
            interval_hidden: None,
            microbatch_offset: 0,
        })
    }

    pub fn topology(&self) -> StageTopology {
        self.topology
    }

    /// Run generation over a full batch.
    ///
    /// Returns the generated token sequences (`[micro_batch_size,
    /// new_length]` each, microbatch order) on the first stage; other stages
    /// return an empty vec.
    pub fn generate_step<C, S>(
        &mut self,
        client: &C,
        stage: &mut S,
        batch: &GenerateBatch<R>,
    ) -> Result<Vec<Tensor<R>>>
    where
        C: RuntimeClient<R> + TensorOps<R> + IndexingOps<R>,
        S: GenerateStage<R>,
    {
        let batch_size = *batch.input_ids.shape().first().ok_or_else(|| Error::Pipeline {
            reason: "batch input_ids must have a batch dimension".to_string(),
        })?;
        let micro_batch_size = self.mb_manager.micro_batch_size();
        if batch_size == 0 || batch_size % micro_batch_size != 0 {
            return Err(Error::Pipeline {
                reason: format!(
                    "batch size {batch_size} is not divisible by micro batch size {micro_batch_size}"
                ),
            });
        }
        let num_microbatches = batch_size / micro_batch_size;
        let buffer_size = self.mb_manager.buffer_size();
        if num_microbatches % buffer_size != 0 {
            return Err(Error::Pipeline {
                reason: format!(
                    "{num_microbatches} microbatches do not fill rounds of {buffer_size}"
                ),
            });
        }
        let rounds = num_microbatches / buffer_size;

        self.microbatch_offset = 0;
        let mut output_sequences = Vec::new();

        for round in 0..rounds {
            trace!(round, stage = self.topology.stage(), "starting generation round");
            self.interval_hidden = None;

            while !self.mb_manager.is_micro_batch_done() {
                if self.topology.is_first_stage() {
                    match self.mb_manager.cur_phase() {
                        MicroBatchPhase::Prefill => self.prefill_action(client, stage, batch)?,
                        MicroBatchPhase::Generate => {
                            self.gen_token_action(client, stage)?;
                            self.head_encoding_action(client, stage)?;
                        }
                        MicroBatchPhase::Cooldown => self.gen_token_action(client, stage)?,
                        MicroBatchPhase::Done => {}
                    }
                } else if self.mb_manager.cur_phase() != MicroBatchPhase::Done {
                    self.body_encoding_action(client, stage)?;
                }
                self.mb_manager.next();
            }

            if self.topology.is_first_stage() {
                output_sequences.extend(self.mb_manager.export_new_tokens(client)?);
            } else {
                // Relay the last body output so the first stage's cooldown
                // receive is matched
                self.comm_action(false)?;
            }
            self.mb_manager.clear();
        }

        Ok(output_sequences)
    }

    /// Exchange hidden states with the neighbor stages: the pending interval
    /// buffer goes downstream, and with `recv_prev` the upstream payload is
    /// returned.
    ///
    /// A single-stage pipeline short-circuits through the local buffer.
    fn comm_action(&mut self, recv_prev: bool) -> Result<Option<Tensor<R>>> {
        if self.topology.num_stages() == 1 {
            return Ok(if recv_prev {
                self.interval_hidden.take()
            } else {
                None
            });
        }

        let payload = self.interval_hidden.take().map(StageEnvelope::new);
        let received = self.p2p.p2p_communicate(payload.as_ref(), recv_prev)?;
        Ok(received.map(|envelope| envelope.hidden_states))
    }

    /// First stage, PREFILL: flush pending hidden, then run the full-sequence
    /// forward on a freshly loaded microbatch.
    fn prefill_action<C, S>(
        &mut self,
        client: &C,
        stage: &mut S,
        batch: &GenerateBatch<R>,
    ) -> Result<()>
    where
        C: RuntimeClient<R> + TensorOps<R>,
        S: GenerateStage<R>,
    {
        self.comm_action(false)?;

        let micro_batch_size = self.mb_manager.micro_batch_size();
        let input_ids = batch
            .input_ids
            .narrow(0, self.microbatch_offset, micro_batch_size)?;
        let attn_mask = batch
            .attn_mask
            .narrow(0, self.microbatch_offset, micro_batch_size)?;
        self.microbatch_offset += micro_batch_size;

        let mut output = stage.forward(StageInput::prefill(input_ids.clone(), attn_mask.clone()))?;
        let hidden = take_hidden(&mut output, "prefill")?;

        let meta = StageInput::prefill(input_ids, attn_mask);
        self.mb_manager.step(client, Some(&meta), Some(output), None)?;
        self.interval_hidden = Some(hidden);
        Ok(())
    }

    /// First stage, GENERATE/COOLDOWN: receive the last stage's hidden states
    /// and decode the next token by arg-max over the logits.
    fn gen_token_action<C, S>(&mut self, client: &C, stage: &mut S) -> Result<()>
    where
        C: RuntimeClient<R> + TensorOps<R> + IndexingOps<R>,
        S: GenerateStage<R>,
    {
        let hidden = self.comm_action(true)?.ok_or_else(|| Error::Pipeline {
            reason: "first stage expected hidden states from the last stage".to_string(),
        })?;

        let mut output = stage.forward(StageInput::from_hidden(hidden))?;
        let logits = output.logits.take().ok_or_else(|| Error::Pipeline {
            reason: "first stage decode must produce logits".to_string(),
        })?;
        let token = decode_token(client, &logits)?;

        self.mb_manager.step(client, None, None, Some(token))?;
        self.interval_hidden = None;
        Ok(())
    }

    /// First stage, GENERATE: re-encode the freshly decoded token against the
    /// cached kv state.
    fn head_encoding_action<C, S>(&mut self, client: &C, stage: &mut S) -> Result<()>
    where
        C: RuntimeClient<R> + TensorOps<R>,
        S: GenerateStage<R>,
    {
        let token = self.last_token()?;
        let attn_mask = self.mb_manager.cur_attn_mask()?;
        let kv_cache = self.mb_manager.take_cur_kv_cache();

        let mut output = stage.forward(StageInput::decode(token, attn_mask, kv_cache))?;
        let hidden = take_hidden(&mut output, "re-encoding")?;

        self.mb_manager.step(client, None, Some(output), None)?;
        self.interval_hidden = Some(hidden);
        Ok(())
    }

    /// Non-first stages: receive upstream hidden states and run the body
    /// forward with the cached kv state.
    fn body_encoding_action<C, S>(&mut self, client: &C, stage: &mut S) -> Result<()>
    where
        C: RuntimeClient<R> + TensorOps<R>,
        S: GenerateStage<R>,
    {
        let received = self.comm_action(true)?.ok_or_else(|| Error::Pipeline {
            reason: "body stage expected hidden states from upstream".to_string(),
        })?;

        let kv_cache = self.mb_manager.take_cur_kv_cache();
        let mut output = stage.forward(StageInput::body(received.clone(), kv_cache))?;
        let hidden = take_hidden(&mut output, "body forward")?;

        let meta = StageInput::body(received, None);
        self.mb_manager.step(client, Some(&meta), Some(output), None)?;
        self.interval_hidden = Some(hidden);
        Ok(())
    }

    /// The token decoded by the immediately preceding `gen_token_action`.
    fn last_token(&self) -> Result<Tensor<R>> {
        self.mb_manager.cur_last_token().ok_or_else(|| Error::Pipeline {
            reason: "re-encoding requires a freshly decoded token".to_string(),
        })
    }
}

/// Greedy decode: arg-max over the vocabulary at the last position.
fn decode_token<R, C>(client: &C, logits: &Tensor<R>) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + TensorOps<R> + IndexingOps<R>,
{
    let shape = logits.shape();
    if shape.len() != 3 {
        return Err(Error::Pipeline {
            reason: format!("expected [batch, seq, vocab] logits, got {shape:?}"),
        });
    }
    let last = logits.narrow(1, shape[1] - 1, 1)?;
    // [batch, 1, vocab] → [batch, 1] i64
    Ok(client.argmax(&last, 2, false)?)
}

fn take_hidden<R: Runtime>(
    output: &mut StageOutput<R>,
    context: &str,
) -> Result<Tensor<R>> {
    output.hidden_states.take().ok_or_else(|| Error::Pipeline {
        reason: format!("{context} must produce hidden states"),
    })
}
