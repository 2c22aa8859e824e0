//! Pipeline-parallel autoregressive generation: stage topology, typed
//! point-to-point envelopes, the microbatch phase state machine, and the
//! schedule that drives them.

pub mod generate;
pub mod microbatch;
pub mod p2p;
pub mod stage;

pub use generate::{GenerateBatch, GenerateConfig, GenerateSchedule};
pub use microbatch::{MicroBatchManager, MicroBatchPhase};
pub use p2p::{PipelineP2p, StageEnvelope};
pub use stage::{GenerateStage, KvCache, StageInput, StageOutput, StageTopology};
