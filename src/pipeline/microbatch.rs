//! Microbatch lifecycle bookkeeping for pipeline generation.
//!
//! Each microbatch moves through `Prefill → Generate → Cooldown → Done`.
//! Cooldown is the pass that decodes the final token: the budget is known to
//! be exhausted, so the token is emitted without re-encoding and the body
//! stages never see it.

use crate::error::{Error, Result};
use crate::pipeline::stage::{KvCache, StageInput, StageOutput};
use numr::dtype::DType;
use numr::ops::TensorOps;
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// Lifecycle phase of one microbatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicroBatchPhase {
    /// Full-sequence forward of the freshly loaded microbatch.
    Prefill,
    /// Decode a token, re-encode it, keep the pipeline fed.
    Generate,
    /// Decode the final token; nothing further flows downstream.
    Cooldown,
    /// Budget exhausted, microbatch retired.
    Done,
}

/// First-stage bookkeeping: tokens, mask, kv cache, and the length budget.
struct HeadDescription<R: Runtime> {
    attn_mask: Tensor<R>,
    kv_cache: Option<KvCache<R>>,
    new_tokens: Vec<Tensor<R>>,
    cur_length: usize,
    target_length: usize,
}

impl<R: Runtime> HeadDescription<R> {
    fn phase(&self) -> MicroBatchPhase {
        if self.cur_length >= self.target_length {
            MicroBatchPhase::Done
        } else if self.cur_length + 1 == self.target_length {
            MicroBatchPhase::Cooldown
        } else {
            MicroBatchPhase::Generate
        }
    }
}

/// Body-stage bookkeeping: kv cache and how many forwards remain.
///
/// The body budget is one less than the head's: the final token is decoded
/// from hidden states the body already produced.
struct BodyDescription<R: Runtime> {
    kv_cache: Option<KvCache<R>>,
    cur_length: usize,
    target_length: usize,
}

impl<R: Runtime> BodyDescription<R> {
    fn phase(&self) -> MicroBatchPhase {
        if self.cur_length >= self.target_length {
            MicroBatchPhase::Done
        } else {
            MicroBatchPhase::Generate
        }
    }
}

enum Description<R: Runtime> {
    Head(HeadDescription<R>),
    Body(BodyDescription<R>),
}

/// Round-robin manager of the in-flight microbatch buffer.
///
/// Holds `buffer_size` descriptors (normally one per pipeline stage so every
/// stage stays busy), advances the current slot with
/// [`next`](MicroBatchManager::next), and retires the whole buffer at round
/// boundaries with [`clear`](MicroBatchManager::clear).
pub struct MicroBatchManager<R: Runtime> {
    is_first_stage: bool,
    new_length: usize,
    micro_batch_size: usize,
    buffer_size: usize,
    descriptions: Vec<Option<Description<R>>>,
    idx: usize,
}

impl<R: Runtime<DType = DType>> MicroBatchManager<R> {
    pub fn new(
        is_first_stage: bool,
        new_length: usize,
        micro_batch_size: usize,
        buffer_size: usize,
    ) -> Result<Self> {
        if new_length == 0 {
            return Err(Error::Config {
                reason: "new_length must be > 0".to_string(),
            });
        }
        if micro_batch_size == 0 || buffer_size == 0 {
            return Err(Error::Config {
                reason: "micro_batch_size and buffer size must be > 0".to_string(),
            });
        }
        let mut descriptions = Vec::with_capacity(buffer_size);
        for _ in 0..buffer_size {
            descriptions.push(None);
        }
        Ok(Self {
            is_first_stage,
            new_length,
            micro_batch_size,
            buffer_size,
            descriptions,
            idx: 0,
        })
    }

    pub fn micro_batch_size(&self) -> usize {
        self.micro_batch_size
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Current slot index in the round-robin buffer.
    pub fn idx(&self) -> usize {
        self.idx
    }

    /// Phase of the current slot. Empty slots are waiting for prefill.
    pub fn cur_phase(&self) -> MicroBatchPhase {
        match &self.descriptions[self.idx] {
            None => MicroBatchPhase::Prefill,
            Some(Description::Head(head)) => head.phase(),
            Some(Description::Body(body)) => body.phase(),
        }
    }

    /// Record one forward (or decoded token) for the current slot.
    ///
    /// * Prefill: pass the stage `input` and `output`; the descriptor is
    ///   created and the kv cache stored.
    /// * Decode on the first stage: pass `new_token`; the token accumulator
    ///   and attention mask grow by one position.
    /// * Re-encode / body forward: pass `output`; the kv cache is replaced.
    pub fn step<C>(
        &mut self,
        client: &C,
        input: Option<&StageInput<R>>,
        output: Option<StageOutput<R>>,
        new_token: Option<Tensor<R>>,
    ) -> Result<()>
    where
        C: RuntimeClient<R> + TensorOps<R>,
    {
        match self.descriptions[self.idx].take() {
            None => {
                let description = if self.is_first_stage {
                    let input = input.ok_or_else(|| Error::Pipeline {
                        reason: "prefill step on the first stage requires inputs".to_string(),
                    })?;
                    let (input_ids, attn_mask) = match (&input.input_ids, &input.attn_mask) {
                        (Some(ids), Some(mask)) => (ids, mask),
                        _ => {
                            return Err(Error::Pipeline {
                                reason: "prefill inputs must carry input_ids and attn_mask"
                                    .to_string(),
                            })
                        }
                    };
                    let prompt_len = *input_ids.shape().last().ok_or_else(|| Error::Pipeline {
                        reason: "input_ids must have a sequence dimension".to_string(),
                    })?;
                    Description::Head(HeadDescription {
                        attn_mask: attn_mask.clone(),
                        kv_cache: output.and_then(|o| o.kv_cache),
                        new_tokens: Vec::with_capacity(self.new_length),
                        cur_length: prompt_len,
                        target_length: prompt_len + self.new_length,
                    })
                } else {
                    let prompt_len = input
                        .and_then(|i| i.hidden_states.as_ref())
                        .and_then(|h| h.shape().get(1).copied())
                        .ok_or_else(|| Error::Pipeline {
                            reason: "body prefill input must carry [batch, seq, hidden] states"
                                .to_string(),
                        })?;
                    Description::Body(BodyDescription {
                        kv_cache: output.and_then(|o| o.kv_cache),
                        cur_length: prompt_len,
                        // The final token never reaches body stages
                        target_length: prompt_len + self.new_length - 1,
                    })
                };
                self.descriptions[self.idx] = Some(description);
            }
            Some(Description::Head(mut head)) => {
                if let Some(token) = new_token {
                    head.cur_length += 1;
                    let ones = Tensor::<R>::ones(
                        &[token.shape()[0], 1],
                        head.attn_mask.dtype(),
                        head.attn_mask.device(),
                    );
                    head.attn_mask = client.cat(&[&head.attn_mask, &ones], 1)?;
                    head.new_tokens.push(token);
                }
                if let Some(output) = output {
                    if output.kv_cache.is_some() {
                        head.kv_cache = output.kv_cache;
                    }
                }
                self.descriptions[self.idx] = Some(Description::Head(head));
            }
            Some(Description::Body(mut body)) => {
                let output = output.ok_or_else(|| Error::Pipeline {
                    reason: "body step requires the stage output".to_string(),
                })?;
                body.cur_length += 1;
                if output.kv_cache.is_some() {
                    body.kv_cache = output.kv_cache;
                }
                self.descriptions[self.idx] = Some(Description::Body(body));
            }
        }
        Ok(())
    }

    /// Advance to the next slot in the round-robin buffer.
    pub fn next(&mut self) {
        self.idx = (self.idx + 1) % self.buffer_size;
    }

    /// Whether every microbatch in the buffer has retired.
    pub fn is_micro_batch_done(&self) -> bool {
        self.descriptions.iter().all(|slot| match slot {
            None => false,
            Some(Description::Head(head)) => head.phase() == MicroBatchPhase::Done,
            Some(Description::Body(body)) => body.phase() == MicroBatchPhase::Done,
        })
    }

    /// Take the current slot's kv cache for the next forward.
    pub fn take_cur_kv_cache(&mut self) -> Option<KvCache<R>> {
        match &mut self.descriptions[self.idx] {
            Some(Description::Head(head)) => head.kv_cache.take(),
            Some(Description::Body(body)) => body.kv_cache.take(),
            None => None,
        }
    }

    /// Most recently decoded token of the current slot (first stage only).
    pub fn cur_last_token(&self) -> Option<Tensor<R>> {
        match &self.descriptions[self.idx] {
            Some(Description::Head(head)) => head.new_tokens.last().cloned(),
            _ => None,
        }
    }

    /// Current slot's attention mask (first stage only).
    pub fn cur_attn_mask(&self) -> Result<Tensor<R>> {
        match &self.descriptions[self.idx] {
            Some(Description::Head(head)) => Ok(head.attn_mask.clone()),
            _ => Err(Error::Pipeline {
                reason: "attention mask is only tracked on the first stage".to_string(),
            }),
        }
    }

    /// Concatenate each finished microbatch's tokens to `[batch, new_length]`.
    pub fn export_new_tokens<C>(&self, client: &C) -> Result<Vec<Tensor<R>>>
    where
        C: RuntimeClient<R> + TensorOps<R>,
    {
        let mut sequences = Vec::new();
        for slot in &self.descriptions {
            if let Some(Description::Head(head)) = slot {
                let refs: Vec<&Tensor<R>> = head.new_tokens.iter().collect();
                if refs.is_empty() {
                    continue;
                }
                sequences.push(client.cat(&refs, 1)?);
            }
        }
        Ok(sequences)
    }

    /// Retire the whole buffer at a round boundary.
    pub fn clear(&mut self) {
        for slot in &mut self.descriptions {
            *slot = None;
        }
        self.idx = 0;
    }
}
