//! Pipeline generation round-trips: a deterministic toy LM split across
//! stages must produce exactly the token sequences of the unsharded
//! single-process reference.

mod common;

use std::sync::Arc;
use std::thread;

use common::TestBus;
use numr::dtype::DType;
use numr::ops::ShapeOps;
use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
use numr::runtime::NoOpCommunicator;
use numr::tensor::Tensor;
use shardr::error::Result;
use shardr::pipeline::{
    GenerateBatch, GenerateConfig, GenerateSchedule, GenerateStage, KvCache, StageInput,
    StageOutput,
};

const HIDDEN: usize = 6;
const PROMPTS: [[i64; 3]; 2] = [[1, 2, 3], [4, 0, 2]];
const NEW_LENGTH: usize = 4;
const TOTAL_LAYERS: usize = 8;

/// One affine "transformer layer" whose output depends on how many positions
/// are cached, so broken kv bookkeeping changes the generated tokens.
struct TinyLayer {
    shift: f32,
}

impl TinyLayer {
    fn forward(
        &self,
        client: &CpuClient,
        x: &Tensor<CpuRuntime>,
        cache: Option<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)>,
    ) -> Result<(Tensor<CpuRuntime>, (Tensor<CpuRuntime>, Tensor<CpuRuntime>))> {
        use numr::ops::ScalarOps;

        let cached_len = cache.as_ref().map(|(k, _)| k.shape()[1]).unwrap_or(0);
        let out = client.add_scalar(x, self.shift as f64 + 0.01 * cached_len as f64)?;

        let new_k = match cache {
            Some((k, _)) => client.cat(&[&k, x], 1)?,
            None => x.clone(),
        };
        let new_v = new_k.clone();
        Ok((out, (new_k, new_v)))
    }
}

/// A contiguous run of layers; the first stage also owns the embedding and
/// the (identity) LM head.
struct TinyStage {
    layers: Vec<TinyLayer>,
    is_head: bool,
}

impl TinyStage {
    /// Stage `stage` of `num_stages`, owning its contiguous slice of the
    /// model's layers.
    fn for_stage(stage: usize, num_stages: usize) -> Self {
        let per_stage = TOTAL_LAYERS / num_stages;
        let layers = (stage * per_stage..(stage + 1) * per_stage)
            .map(|layer_idx| TinyLayer {
                shift: 0.05 * (layer_idx + 1) as f32,
            })
            .collect();
        Self {
            layers,
            is_head: stage == 0,
        }
    }

    fn embed(&self, device: &CpuDevice, ids: &Tensor<CpuRuntime>) -> Tensor<CpuRuntime> {
        let shape = ids.shape().to_vec();
        let tokens = ids.to_vec::<i64>();
        let mut data = Vec::with_capacity(tokens.len() * HIDDEN);
        for &t in &tokens {
            for j in 0..HIDDEN {
                data.push((((t as usize + 1) * (j + 1)) % 11) as f32 * 0.1);
            }
        }
        Tensor::<CpuRuntime>::from_slice(&data, &[shape[0], shape[1], HIDDEN], device)
    }

    fn run_layers(
        &self,
        client: &CpuClient,
        hidden: Tensor<CpuRuntime>,
        kv_cache: Option<KvCache<CpuRuntime>>,
    ) -> Result<(Tensor<CpuRuntime>, KvCache<CpuRuntime>)> {
        let mut cache_iter = kv_cache.unwrap_or_default().into_iter();
        let mut out = hidden;
        let mut new_caches = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let (next, new_cache) = layer.forward(client, &out, cache_iter.next())?;
            out = next;
            new_caches.push(new_cache);
        }
        Ok((out, new_caches))
    }
}

struct TinyStageDriver {
    stage: TinyStage,
    client: CpuClient,
    device: CpuDevice,
}

impl GenerateStage<CpuRuntime> for TinyStageDriver {
    fn forward(&mut self, input: StageInput<CpuRuntime>) -> Result<StageOutput<CpuRuntime>> {
        // Head decode: hidden states in, logits out
        if self.stage.is_head && input.hidden_states.is_some() && input.input_ids.is_none() {
            return Ok(StageOutput {
                hidden_states: None,
                logits: input.hidden_states,
                kv_cache: None,
            });
        }

        let hidden = if let Some(ids) = &input.input_ids {
            self.stage.embed(&self.device, ids)
        } else {
            input.hidden_states.ok_or_else(|| shardr::Error::Pipeline {
                reason: "body stage needs hidden states".to_string(),
            })?
        };

        let (out, kv) = self
            .stage
            .run_layers(&self.client, hidden, input.kv_cache)?;
        Ok(StageOutput {
            hidden_states: Some(out),
            logits: None,
            kv_cache: Some(kv),
        })
    }
}

fn make_batch(device: &CpuDevice) -> GenerateBatch<CpuRuntime> {
    let flat: Vec<i64> = PROMPTS.iter().flatten().copied().collect();
    let input_ids = Tensor::<CpuRuntime>::from_slice(&flat, &[2, 3], device);
    let attn_mask = Tensor::<CpuRuntime>::ones(&[2, 3], DType::F32, device);
    GenerateBatch {
        input_ids,
        attn_mask,
    }
}

/// Reference: the whole model on one stage, same schedule code.
fn reference_sequences() -> Vec<Vec<i64>> {
    let device = CpuDevice::new();
    let client = CpuClient::new(device.clone());
    let mut schedule = GenerateSchedule::new(
        Arc::new(NoOpCommunicator),
        device.clone(),
        GenerateConfig {
            new_length: NEW_LENGTH,
            micro_batch_size: 1,
            micro_batch_buffer_size: None,
        },
    )
    .unwrap();
    let mut driver = TinyStageDriver {
        stage: TinyStage::for_stage(0, 1),
        client: client.clone(),
        device: device.clone(),
    };
    let batch = make_batch(&device);
    let sequences = schedule.generate_step(&client, &mut driver, &batch).unwrap();
    sequences.iter().map(|t| t.to_vec::<i64>()).collect()
}

fn pipelined_sequences(num_stages: usize) -> Vec<Vec<i64>> {
    let endpoints = TestBus::group(num_stages);
    let handles: Vec<_> = endpoints
        .into_iter()
        .enumerate()
        .map(|(stage_idx, bus)| {
            thread::spawn(move || {
                let device = CpuDevice::new();
                let client = CpuClient::new(device.clone());
                let mut schedule = GenerateSchedule::new(
                    Arc::new(bus),
                    device.clone(),
                    GenerateConfig {
                        new_length: NEW_LENGTH,
                        micro_batch_size: 1,
                        micro_batch_buffer_size: Some(2),
                    },
                )
                .unwrap();
                let mut driver = TinyStageDriver {
                    stage: TinyStage::for_stage(stage_idx, num_stages),
                    client: client.clone(),
                    device: device.clone(),
                };
                let batch = make_batch(&device);
                let sequences = schedule.generate_step(&client, &mut driver, &batch).unwrap();
                sequences
                    .iter()
                    .map(|t| t.to_vec::<i64>())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut results: Vec<Vec<Vec<i64>>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    // Only the first stage produces output sequences
    for other in &results[1..] {
        assert!(other.is_empty(), "non-first stages must not emit sequences");
    }
    results.swap_remove(0)
}

#[test]
fn reference_shape_and_determinism() {
    let first = reference_sequences();
    assert_eq!(first.len(), 2, "one sequence per microbatch");
    for sequence in &first {
        assert_eq!(sequence.len(), NEW_LENGTH);
    }
    assert_eq!(first, reference_sequences());
}

#[test]
fn four_stage_pipeline_matches_reference() {
    let reference = reference_sequences();
    let pipelined = pipelined_sequences(4);
    assert_eq!(pipelined, reference);
}

#[test]
fn two_stage_pipeline_matches_reference() {
    // Exercises the fused single-round-trip exchange path
    let reference = reference_sequences();
    let pipelined = pipelined_sequences(2);
    assert_eq!(pipelined, reference);
}
