//! # shardr
//!
//! **ZeRO-style sharded optimization and pipeline-parallel generation built on numr.**
//!
//! shardr provides the distributed-training core that sits between a model
//! and numr's runtime: a sharded optimizer that partitions optimizer state
//! and gradients across data-parallel ranks, and a generation schedule that
//! drives transformer stages through pipeline-parallel decoding.
//!
//! ## Layout
//!
//! - [`zero`] — bookkeeping stores (parameter/gradient/bucket), dynamic loss
//!   scaling, greedy parameter partitioning, and [`zero::ShardedOptimizer`]
//! - [`optim`] — inner optimizers stepping flat fp32 master partitions
//! - [`pipeline`] — stage topology, typed hidden-state envelopes, the
//!   microbatch phase machine, and [`pipeline::GenerateSchedule`]
//! - [`comm`] — safe tensor-level wrappers over numr's `Communicator`
//!
//! ## Design
//!
//! - One process per rank; collectives are the only synchronization points
//! - Gradients reach the optimizer as explicit gradient-ready events, not
//!   autograd hook callbacks
//! - fp16 working weights, fp32 rank-local masters, bucketed all-reduce with
//!   optional communication/computation overlap

pub mod comm;
pub mod error;
pub mod optim;
pub mod pipeline;
pub mod zero;

pub use error::{Error, Result};
pub use optim::{FlatAdamW, FlatAdamWConfig, PartitionOptimizer};
pub use pipeline::{GenerateConfig, GenerateSchedule, MicroBatchManager, MicroBatchPhase};
pub use zero::{ParamId, ShardedOptimizer, ShardedOptimizerConfig};

// Re-export numr types that users will commonly need
pub use numr::dtype::DType;
pub use numr::runtime::{Communicator, ReduceOp, Runtime, RuntimeClient};
pub use numr::tensor::Tensor;
