//! Inner optimizers that step flat fp32 master partitions.

pub mod adamw;
pub mod traits;

pub use adamw::{FlatAdamW, FlatAdamWConfig};
pub use traits::{FlatPartition, PartitionOptimizer};
