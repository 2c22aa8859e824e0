//! ZeRO-style sharded optimizer.
//!
//! Wraps a [`PartitionOptimizer`] and shards optimizer state across
//! data-parallel ranks: parameters are assigned to ranks by a greedy
//! load-balancing pass, each rank keeps an fp32 master copy of its own shard
//! only, and gradients are reduced through a size-bounded communication
//! bucket so many small collectives become a few large ones.
//!
//! Step lifecycle per iteration:
//! 1. backward produces gradients; the caller announces each one via
//!    [`grad_ready`](ShardedOptimizer::grad_ready)
//! 2. [`sync_grad`](ShardedOptimizer::sync_grad) flushes the final bucket and
//!    settles in-flight collectives
//! 3. [`step`](ShardedOptimizer::step) checks overflow, unscales/clips, steps
//!    the inner optimizer on the fp32 shard, and broadcasts updated fp16
//!    shards to every rank

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::comm::{all_reduce_tensor, broadcast_tensor, sync};
use crate::error::{Error, Result};
use crate::optim::{FlatPartition, PartitionOptimizer};
use crate::zero::events::{GradReadyEvent, GradReadyQueue};
use crate::zero::loss_scaler::{DynamicLossScaler, LossScalerConfig};
use crate::zero::partition::{padding_for, partition_balanced};
use crate::zero::store::{BucketStore, GradientStore, ParameterStore};
use crate::zero::ParamId;
use numr::dtype::DType;
use numr::ops::{BinaryOps, ReduceOps, ScalarOps, TensorOps, TypeConversionOps, UnaryOps};
use numr::runtime::{Communicator, ReduceOp, Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// Sharded optimizer configuration.
#[derive(Debug, Clone)]
pub struct ShardedOptimizerConfig {
    /// Dynamic loss scaling parameters.
    pub loss_scaler: LossScalerConfig,
    /// Global gradient L2-norm ceiling; `0.0` disables clipping.
    pub clip_grad_norm: f64,
    /// Bucket capacity in elements (padding included).
    pub reduce_bucket_size: usize,
    /// Wire dtype for bucket reduction; `None` keeps the gradient dtype.
    pub communication_dtype: Option<DType>,
    /// Launch bucket collectives without an inline sync so reduction overlaps
    /// with the remaining backward compute.
    pub overlap_communication: bool,
    /// Keep gradient slices only for parameters this rank owns (ZeRO-2 style
    /// gradient partitioning).
    pub partition_grad: bool,
    /// Accumulate gradients across multiple backward passes before stepping.
    pub grad_accumulation: bool,
}

impl Default for ShardedOptimizerConfig {
    fn default() -> Self {
        Self {
            loss_scaler: LossScalerConfig::default(),
            clip_grad_norm: 0.0,
            reduce_bucket_size: 12 * 1024 * 1024,
            communication_dtype: None,
            overlap_communication: false,
            partition_grad: false,
            grad_accumulation: false,
        }
    }
}

impl ShardedOptimizerConfig {
    pub fn with_clip_grad_norm(mut self, max_norm: f64) -> Self {
        self.clip_grad_norm = max_norm;
        self
    }

    pub fn with_reduce_bucket_size(mut self, elements: usize) -> Self {
        self.reduce_bucket_size = elements;
        self
    }

    pub fn with_overlap_communication(mut self, overlap: bool) -> Self {
        self.overlap_communication = overlap;
        self
    }

    pub fn with_loss_scaler(mut self, loss_scaler: LossScalerConfig) -> Self {
        self.loss_scaler = loss_scaler;
        self
    }
}

/// Registration record for one working parameter.
struct ParamRecord<R: Runtime> {
    tensor: Tensor<R>,
    group_id: usize,
    shape: Vec<usize>,
    numel: usize,
    padding: usize,
}

/// A bucket whose collective has been launched but whose result has not been
/// consumed yet. With overlapped communication these accumulate during
/// backward and settle together after one `Communicator::sync`.
struct PendingReduction<R: Runtime> {
    wire: Tensor<R>,
    grad_dtype: DType,
    slice_params: Vec<ParamId>,
    slice_sizes: Vec<usize>,
    group_id: usize,
}

/// ZeRO sharded optimizer over fp16 working parameters.
pub struct ShardedOptimizer<R: Runtime<DType = DType>, O: PartitionOptimizer<R>> {
    inner: O,
    config: ShardedOptimizerConfig,
    comm: Arc<dyn Communicator>,
    mp_comm: Option<Arc<dyn Communicator>>,
    device: R::Device,

    params: Vec<ParamRecord<R>>,
    param_groups: Vec<Vec<ParamId>>,

    param_store: ParameterStore<R>,
    grad_store: GradientStore<R>,
    bucket_store: BucketStore<R>,
    grad_queue: GradReadyQueue<R>,
    pending_reductions: Vec<PendingReduction<R>>,

    loss_scaler: DynamicLossScaler,
    /// Rank-local fp32 master per group; `None` when this rank's shard of the
    /// group is empty.
    fp32_masters: Vec<Option<Tensor<R>>>,
}

impl<R, O> ShardedOptimizer<R, O>
where
    R: Runtime<DType = DType>,
    O: PartitionOptimizer<R>,
{
    /// Build the sharded optimizer from fp16 parameter groups.
    ///
    /// Partitions every group across ranks, builds the per-rank flat fp16
    /// buffers, and clones this rank's shard to fp32. Configuration problems
    /// are reported here, before any communication is attempted.
    pub fn new<C>(
        client: &C,
        comm: Arc<dyn Communicator>,
        mp_comm: Option<Arc<dyn Communicator>>,
        groups: Vec<Vec<Tensor<R>>>,
        inner: O,
        config: ShardedOptimizerConfig,
    ) -> Result<Self>
    where
        C: RuntimeClient<R> + TensorOps<R> + TypeConversionOps<R>,
    {
        if groups.iter().all(|g| g.is_empty()) {
            return Err(Error::Config {
                reason: "no parameters to shard".to_string(),
            });
        }
        if config.partition_grad && config.grad_accumulation {
            return Err(Error::Config {
                reason: "gradient partitioning cannot be combined with gradient accumulation"
                    .to_string(),
            });
        }
        if config.clip_grad_norm < 0.0 {
            return Err(Error::Config {
                reason: format!("clip_grad_norm must be >= 0, got {}", config.clip_grad_norm),
            });
        }
        if config.reduce_bucket_size == 0 {
            return Err(Error::Config {
                reason: "reduce_bucket_size must be > 0".to_string(),
            });
        }
        for param in groups.iter().flatten() {
            if param.dtype() != DType::F16 {
                return Err(Error::Config {
                    reason: format!(
                        "working parameters are expected to be f16, got {:?}",
                        param.dtype()
                    ),
                });
            }
        }
        let loss_scaler = DynamicLossScaler::new(config.loss_scaler.clone())?;

        let device = groups
            .iter()
            .flatten()
            .next()
            .expect("checked non-empty above")
            .device()
            .clone();

        let world_size = comm.world_size();
        let local_rank = comm.rank();

        let mut param_store = ParameterStore::new(comm.as_ref());
        let grad_store = GradientStore::new(comm.as_ref(), false);
        let bucket_store = BucketStore::new(comm.as_ref());

        let mut params: Vec<ParamRecord<R>> = Vec::new();
        let mut param_groups: Vec<Vec<ParamId>> = Vec::new();
        let mut fp32_masters: Vec<Option<Tensor<R>>> = Vec::new();

        for (group_id, group) in groups.into_iter().enumerate() {
            let mut ids = Vec::with_capacity(group.len());
            for tensor in group {
                let id = ParamId::new(params.len());
                params.push(ParamRecord {
                    shape: tensor.shape().to_vec(),
                    numel: tensor.numel(),
                    padding: padding_for(tensor.numel(), world_size),
                    tensor,
                    group_id,
                });
                ids.push(id);
            }

            // Assign whole parameters to ranks, largest first
            let numels: Vec<usize> = ids.iter().map(|id| params[id.index()].numel).collect();
            let assignment = partition_balanced(&numels, world_size);

            let mut per_rank: Vec<Vec<ParamId>> = vec![Vec::new(); world_size];
            for (&id, &rank) in ids.iter().zip(&assignment) {
                param_store.set_param_to_rank(id, rank)?;
                param_store.set_param_reduction_state(id, false);
                per_rank[rank].push(id);
            }
            let numel_per_rank: Vec<usize> = per_rank
                .iter()
                .map(|list| list.iter().map(|id| params[id.index()].numel).sum())
                .collect();
            debug!(group_id, ?numel_per_rank, "partitioned parameter group");

            // One contiguous fp16 buffer per rank; reduced/broadcast as a unit
            for (rank, list) in per_rank.into_iter().enumerate() {
                if !list.is_empty() {
                    let flats: Vec<Tensor<R>> = list
                        .iter()
                        .map(|id| params[id.index()].tensor.flatten())
                        .collect::<std::result::Result<_, _>>()?;
                    let refs: Vec<&Tensor<R>> = flats.iter().collect();
                    let flat = client.cat(&refs, 0)?;
                    param_store.set_flat_param_by_rank_group(rank, group_id, flat);
                }
                param_store.add_param_list_by_rank_group(rank, group_id, list);
            }

            // fp32 master of this rank's shard — the tensor the inner
            // optimizer actually steps
            let master = if param_store
                .params_by_rank_group(local_rank, group_id)
                .is_empty()
            {
                None
            } else {
                let flat = param_store.flat_param_by_rank_group(local_rank, group_id)?;
                Some(client.cast(flat, DType::F32)?)
            };
            fp32_masters.push(master);
            param_groups.push(ids);
        }

        let total_params = params.len();

        Ok(Self {
            inner,
            config,
            comm,
            mp_comm,
            device,
            params,
            param_groups,
            param_store,
            grad_store,
            bucket_store,
            grad_queue: GradReadyQueue::new(total_params),
            pending_reductions: Vec::new(),
            loss_scaler,
            fp32_masters,
        })
    }

    /// Current loss scale.
    pub fn loss_scale(&self) -> f64 {
        self.loss_scaler.scale()
    }

    /// Scale a loss value before backward.
    pub fn scale_loss(&self, loss: f64) -> f64 {
        self.loss_scaler.scale_loss(loss)
    }

    /// Parameter handles of one group, in registration order.
    pub fn param_ids(&self, group_id: usize) -> &[ParamId] {
        &self.param_groups[group_id]
    }

    pub fn num_param_groups(&self) -> usize {
        self.param_groups.len()
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.inner.set_lr(lr);
    }

    pub fn lr(&self) -> f64 {
        self.inner.lr()
    }

    /// Announce that a parameter's gradient is ready for reduction.
    ///
    /// With `overlap_communication` the event is consumed immediately so the
    /// bucket collective launches while backward is still running; otherwise
    /// events wait in the queue until [`sync_grad`](Self::sync_grad).
    pub fn grad_ready<C>(
        &mut self,
        client: &C,
        group_id: usize,
        param_id: ParamId,
        grad: Tensor<R>,
    ) -> Result<()>
    where
        C: RuntimeClient<R> + TensorOps<R> + ScalarOps<R> + TypeConversionOps<R> + BinaryOps<R>,
    {
        let record = self.param_record(param_id)?;
        if record.group_id != group_id {
            return Err(Error::Accounting {
                reason: format!("{param_id} belongs to group {}, not {group_id}", record.group_id),
            });
        }
        if grad.numel() != record.numel {
            return Err(Error::Accounting {
                reason: format!(
                    "{param_id} gradient has {} elements, parameter has {}",
                    grad.numel(),
                    record.numel
                ),
            });
        }
        if grad.dtype() != record.tensor.dtype() {
            return Err(Error::Accounting {
                reason: format!(
                    "{param_id} gradient dtype {:?} does not match parameter dtype {:?}",
                    grad.dtype(),
                    record.tensor.dtype()
                ),
            });
        }

        self.grad_queue.push(GradReadyEvent {
            group_id,
            param_id,
            grad,
        })?;

        if self.config.overlap_communication {
            self.drain_grad_events(client)?;
        }
        Ok(())
    }

    /// Flush all pending gradient work and settle in-flight collectives.
    ///
    /// Must be called once per backward pass, before [`step`](Self::step).
    /// Resets the per-step reduction flags on completion.
    pub fn sync_grad<C>(&mut self, client: &C) -> Result<()>
    where
        C: RuntimeClient<R> + TensorOps<R> + ScalarOps<R> + TypeConversionOps<R> + BinaryOps<R>,
    {
        self.drain_grad_events(client)?;
        self.run_reduction(client)?;

        if !self.pending_reductions.is_empty() {
            // Collectives launched during backward are settled here, before
            // any consumer reads the reduced buffers
            sync(self.comm.as_ref(), "overlapped bucket reduction")?;
            for pending in std::mem::take(&mut self.pending_reductions) {
                self.settle_reduction(client, pending)?;
            }
        }

        self.param_store.reset_reduction_states();
        Ok(())
    }

    /// Drop all recorded gradients and pending bucket state.
    pub fn zero_grad(&mut self) {
        while self.grad_queue.pop().is_some() {}
        self.pending_reductions.clear();
        self.grad_store.reset_all_gradients();
        self.bucket_store.reset();
        self.param_store.reset_reduction_states();
    }

    /// One optimizer step over the rank-local fp32 shard.
    ///
    /// Returns `Ok(false)` when the step was skipped because of gradient
    /// overflow (the loss scale has been backed off and gradients cleared),
    /// `Ok(true)` after a successful update and shard broadcast.
    pub fn step<C>(&mut self, client: &C) -> Result<bool>
    where
        C: RuntimeClient<R>
            + TensorOps<R>
            + ScalarOps<R>
            + BinaryOps<R>
            + UnaryOps<R>
            + ReduceOps<R>
            + TypeConversionOps<R>,
    {
        if !self.grad_queue.is_empty()
            || !self.bucket_store.is_empty()
            || !self.pending_reductions.is_empty()
        {
            self.sync_grad(client)?;
        }

        if self.check_overflow(client)? {
            warn!(
                loss_scale = self.loss_scaler.scale(),
                "gradient overflow detected, skipping optimizer step"
            );
            self.loss_scaler.update(true);
            self.grad_store.reset_all_gradients();
            self.bucket_store.reset();
            return Ok(false);
        }

        // Assemble this rank's flat fp32 gradient per group and accumulate
        // the local squared norm
        let mut flat_grads: Vec<Option<Tensor<R>>> = Vec::with_capacity(self.param_groups.len());
        let mut local_norm_sq = 0.0f64;

        for group_id in 0..self.param_groups.len() {
            // Owned and non-owned release lists are tracked independently
            let owned: Vec<ParamId> = self
                .param_store
                .params_by_rank_group(self.param_store.local_rank(), group_id)
                .to_vec();
            let not_owned: Vec<ParamId> = self.param_groups[group_id]
                .iter()
                .copied()
                .filter(|id| !self.param_store.belongs_to_current_rank(*id))
                .collect();

            // Non-owned slices are dead weight from here on
            for id in not_owned {
                self.grad_store.drop_param_gradients(group_id, id);
            }

            if owned.is_empty() {
                flat_grads.push(None);
                self.grad_store.reset_grads_by_group_id(group_id);
                continue;
            }

            let mut full_grads: Vec<Tensor<R>> = Vec::with_capacity(owned.len());
            for &id in &owned {
                full_grads.push(self.assemble_full_grad(client, group_id, id)?);
            }
            let refs: Vec<&Tensor<R>> = full_grads.iter().collect();
            let flat = client.cat(&refs, 0)?;

            let master = self.fp32_masters[group_id]
                .as_ref()
                .expect("owned shard implies master buffer");
            if flat.numel() != master.numel() {
                return Err(Error::Accounting {
                    reason: format!(
                        "group {group_id}: flat gradient has {} elements, master has {}",
                        flat.numel(),
                        master.numel()
                    ),
                });
            }

            let sq = client.mul(&flat, &flat)?;
            let sum = client.sum(&sq, &[0], false)?;
            local_norm_sq += sum.to_vec::<f32>()[0] as f64;

            flat_grads.push(Some(flat));
            self.grad_store.reset_grads_by_group_id(group_id);
        }

        // Norm is computed on scaled gradients: global_norm = true_norm * scale
        let global_norm = self.reduce_norm(local_norm_sq)?;
        let combined_scale = self.combined_scale(global_norm);

        let mut partitions: Vec<FlatPartition<R>> = Vec::new();
        let mut stepped_groups: Vec<usize> = Vec::new();
        for (group_id, flat) in flat_grads.into_iter().enumerate() {
            let Some(flat) = flat else { continue };
            let unscaled = client.mul_scalar(&flat, 1.0 / combined_scale)?;
            partitions.push(FlatPartition {
                param: self.fp32_masters[group_id]
                    .as_ref()
                    .expect("owned shard implies master buffer")
                    .clone(),
                grad: unscaled,
            });
            stepped_groups.push(group_id);
        }

        self.inner.step(client, &mut partitions)?;

        // Write the updated masters back as fp16 and publish every rank's
        // shard to the full data-parallel group
        let local_rank = self.param_store.local_rank();
        for (partition, &group_id) in partitions.into_iter().zip(&stepped_groups) {
            let fp16 = client.cast(&partition.param, DType::F16)?;
            self.fp32_masters[group_id] = Some(partition.param);
            self.param_store
                .set_flat_param_by_rank_group(local_rank, group_id, fp16);
        }

        for group_id in 0..self.param_groups.len() {
            for rank in 0..self.param_store.world_size() {
                if self
                    .param_store
                    .params_by_rank_group(rank, group_id)
                    .is_empty()
                {
                    continue;
                }
                let flat = self.param_store.flat_param_by_rank_group(rank, group_id)?;
                broadcast_tensor(self.comm.as_ref(), flat, rank)?;
            }
        }
        sync(self.comm.as_ref(), "shard broadcast")?;

        self.loss_scaler.update(false);
        Ok(true)
    }

    /// Elements currently waiting in the communication bucket.
    pub fn bucket_elements(&self) -> usize {
        self.bucket_store.num_elements_in_bucket()
    }

    /// Recorded per-rank gradient slices of a parameter (empty when the
    /// parameter has no gradient this step).
    pub fn grad_slices(&self, group_id: usize, param_id: ParamId) -> &[Tensor<R>] {
        self.grad_store
            .get_partitioned_gradients_by_param_id(group_id, param_id)
    }

    /// Rebuild the full fp16 parameter set from the flat buffers.
    ///
    /// After [`step`](Self::step) every rank's buffers hold the updated
    /// values, so the returned map is the complete parameter set for the next
    /// forward pass.
    pub fn export_working_params(&self) -> Result<HashMap<ParamId, Tensor<R>>> {
        let mut out = HashMap::new();
        for group_id in 0..self.param_groups.len() {
            for rank in 0..self.param_store.world_size() {
                let list = self.param_store.params_by_rank_group(rank, group_id);
                if list.is_empty() {
                    continue;
                }
                let flat = self.param_store.flat_param_by_rank_group(rank, group_id)?;
                let mut offset = 0usize;
                for &id in list {
                    let record = self.param_record(id)?;
                    let slice = flat.narrow(0, offset, record.numel)?;
                    out.insert(id, slice.reshape(&record.shape)?);
                    offset += record.numel;
                }
            }
        }
        Ok(out)
    }

    // ---- internals ----

    fn param_record(&self, param_id: ParamId) -> Result<&ParamRecord<R>> {
        self.params
            .get(param_id.index())
            .ok_or_else(|| Error::Accounting {
                reason: format!("{param_id} is not registered with this optimizer"),
            })
    }

    /// Consume queued gradient-ready events into the bucket, flushing
    /// whenever the next gradient would overflow the bucket capacity.
    fn drain_grad_events<C>(&mut self, client: &C) -> Result<()>
    where
        C: RuntimeClient<R> + TensorOps<R> + ScalarOps<R> + TypeConversionOps<R> + BinaryOps<R>,
    {
        while let Some(event) = self.grad_queue.pop() {
            let (numel, padding) = {
                let record = self.param_record(event.param_id)?;
                (record.numel, record.padding)
            };

            // Flush before adding when the bucket would overflow, or when the
            // group changes (a bucket reduces one group at a time)
            let incoming = numel + padding;
            if !self.bucket_store.is_empty()
                && (self.bucket_store.num_elements_in_bucket() + incoming
                    > self.config.reduce_bucket_size
                    || self.bucket_store.current_group_id() != event.group_id)
            {
                self.run_reduction(client)?;
            }

            if self.param_store.is_param_reduced(event.param_id) {
                return Err(Error::Accounting {
                    reason: format!(
                        "{} has already been reduced this step; duplicate reduction would corrupt gradients",
                        event.param_id
                    ),
                });
            }
            self.param_store
                .set_param_reduction_state(event.param_id, true);

            self.bucket_store
                .add_param_grad(event.group_id, event.param_id, event.grad, padding);
        }
        Ok(())
    }

    /// Reduce the current bucket: flatten, launch the all-reduce, and either
    /// settle inline (synchronous mode) or leave the result in flight for
    /// [`sync_grad`](Self::sync_grad) to settle (overlap mode).
    fn run_reduction<C>(&mut self, client: &C) -> Result<()>
    where
        C: RuntimeClient<R> + TensorOps<R> + ScalarOps<R> + TypeConversionOps<R> + BinaryOps<R>,
    {
        if self.bucket_store.is_empty() {
            return Ok(());
        }

        self.bucket_store.build_grad_in_bucket(client)?;
        let flat = self.bucket_store.get_flatten_grad(client)?;
        let grad_dtype = flat.dtype();

        let wire = match self.config.communication_dtype {
            Some(dt) if dt != grad_dtype => client.cast(&flat, dt)?,
            _ => flat,
        };
        all_reduce_tensor(self.comm.as_ref(), &wire, ReduceOp::Sum)?;

        let pending = PendingReduction {
            wire,
            grad_dtype,
            slice_params: self.bucket_store.slice_params().to_vec(),
            slice_sizes: self.bucket_store.slice_sizes().to_vec(),
            group_id: self.bucket_store.current_group_id(),
        };
        self.bucket_store.reset();

        if self.config.overlap_communication {
            self.pending_reductions.push(pending);
        } else {
            sync(self.comm.as_ref(), "bucket reduction")?;
            self.settle_reduction(client, pending)?;
        }
        Ok(())
    }

    /// Average a completed bucket collective and record the per-rank slices.
    ///
    /// Must only run after the collective has been synchronized against.
    fn settle_reduction<C>(&mut self, client: &C, pending: PendingReduction<R>) -> Result<()>
    where
        C: RuntimeClient<R> + ScalarOps<R> + TypeConversionOps<R> + BinaryOps<R>,
    {
        let world_size = self.param_store.world_size();

        let summed = if pending.wire.dtype() != pending.grad_dtype {
            client.cast(&pending.wire, pending.grad_dtype)?
        } else {
            pending.wire
        };
        let averaged = if world_size > 1 {
            client.mul_scalar(&summed, 1.0 / world_size as f64)?
        } else {
            summed
        };

        let mut offset = 0usize;
        for rank in 0..world_size {
            for (slice_idx, &size) in pending.slice_sizes.iter().enumerate() {
                let param_id = pending.slice_params[slice_idx];
                let keep = !self.config.partition_grad
                    || self.param_store.belongs_to_current_rank(param_id);
                if keep {
                    let slice = averaged.narrow(0, offset, size)?;
                    self.record_slice(client, slice, rank, pending.group_id, param_id)?;
                }
                offset += size;
            }
        }
        Ok(())
    }

    /// Record one averaged slice, accumulating in place across
    /// gradient-accumulation boundaries.
    fn record_slice<C>(
        &mut self,
        client: &C,
        slice: Tensor<R>,
        rank: usize,
        group_id: usize,
        param_id: ParamId,
    ) -> Result<()>
    where
        C: RuntimeClient<R> + BinaryOps<R>,
    {
        let world_size = self.param_store.world_size();
        let have = self.grad_store.num_slices(group_id, param_id);
        if have >= world_size {
            if !self.config.grad_accumulation {
                return Err(Error::Accounting {
                    reason: format!(
                        "{param_id} already has {have} recorded slices without gradient accumulation enabled"
                    ),
                });
            }
            self.grad_store
                .add_gradients_by_param_id(client, &slice, rank, group_id, param_id)?;
        } else {
            self.grad_store
                .append_gradients_by_param_id(slice, group_id, param_id);
        }
        Ok(())
    }

    /// Concatenate a parameter's per-rank slices and strip the padding.
    fn assemble_full_grad<C>(
        &self,
        client: &C,
        group_id: usize,
        param_id: ParamId,
    ) -> Result<Tensor<R>>
    where
        C: RuntimeClient<R> + TensorOps<R> + TypeConversionOps<R>,
    {
        let record = self.param_record(param_id)?;
        let slices = self
            .grad_store
            .get_partitioned_gradients_by_param_id(group_id, param_id);

        // No gradient recorded (frozen parameter): contribute zeros so the
        // flat layout stays aligned with the master buffer
        if slices.is_empty() {
            return Ok(Tensor::<R>::zeros(
                &[record.numel],
                DType::F32,
                &self.device,
            ));
        }

        let refs: Vec<&Tensor<R>> = slices.iter().collect();
        let padded = client.cat(&refs, 0)?;
        let full = if record.padding > 0 {
            padded.narrow(0, 0, record.numel)?
        } else {
            padded
        };
        Ok(client.cast(&full, DType::F32)?)
    }

    /// Scan local averaged gradients for Inf/NaN and agree on the result
    /// across the data-parallel (and model-parallel) groups via max-reduction.
    fn check_overflow<C>(&self, client: &C) -> Result<bool>
    where
        C: RuntimeClient<R> + UnaryOps<R> + ReduceOps<R>,
    {
        let mut local = 0.0f32;
        'scan: for group_id in 0..self.param_groups.len() {
            for grad in self.grad_store.get_working_grads_by_group_id(group_id) {
                if has_inf_or_nan(client, &grad)? {
                    local = 1.0;
                    break 'scan;
                }
            }
        }

        let flag = Tensor::<R>::from_slice(&[local], &[1], &self.device);
        all_reduce_tensor(self.comm.as_ref(), &flag, ReduceOp::Max)?;
        sync(self.comm.as_ref(), "overflow flag reduction")?;

        if let Some(mp) = &self.mp_comm {
            all_reduce_tensor(mp.as_ref(), &flag, ReduceOp::Max)?;
            sync(mp.as_ref(), "overflow flag mp reduction")?;
        }

        Ok(flag.to_vec::<f32>()[0] > 0.0)
    }

    /// All-reduce the squared norm across ranks and take the root.
    fn reduce_norm(&self, local_norm_sq: f64) -> Result<f64> {
        let acc = Tensor::<R>::from_slice(&[local_norm_sq as f32], &[1], &self.device);
        all_reduce_tensor(self.comm.as_ref(), &acc, ReduceOp::Sum)?;
        sync(self.comm.as_ref(), "gradient norm reduction")?;

        if let Some(mp) = &self.mp_comm {
            all_reduce_tensor(mp.as_ref(), &acc, ReduceOp::Sum)?;
            sync(mp.as_ref(), "gradient norm mp reduction")?;
        }

        Ok((acc.to_vec::<f32>()[0] as f64).sqrt())
    }

    /// Fold the clip factor into the loss scale when the unscaled norm
    /// exceeds the configured ceiling.
    fn combined_scale(&self, global_norm: f64) -> f64 {
        let loss_scale = self.loss_scaler.scale();
        if self.config.clip_grad_norm > 0.0 {
            let clip = (global_norm / loss_scale + 1e-6) / self.config.clip_grad_norm;
            if clip > 1.0 {
                return clip * loss_scale;
            }
        }
        loss_scale
    }
}

/// Whether a tensor contains Inf or NaN, checked on-device.
fn has_inf_or_nan<R, C>(client: &C, tensor: &Tensor<R>) -> Result<bool>
where
    R: Runtime<DType = DType>,
    C: UnaryOps<R> + ReduceOps<R>,
{
    let nan_mask = client.isnan(tensor)?;
    let inf_mask = client.isinf(tensor)?;
    let has_nan = client.any(&nan_mask, &[], false)?;
    let has_inf = client.any(&inf_mask, &[], false)?;
    Ok(has_nan.item::<u8>()? != 0 || has_inf.item::<u8>()? != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::{FlatAdamW, FlatAdamWConfig};
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::{CpuClient, CpuRuntime};
    use numr::runtime::NoOpCommunicator;

    fn f16_param(client: &CpuClient, device: &numr::runtime::cpu::CpuDevice, data: &[f32]) -> Tensor<CpuRuntime> {
        let f32_tensor = Tensor::<CpuRuntime>::from_slice(data, &[data.len()], device);
        client.cast(&f32_tensor, DType::F16).unwrap()
    }

    fn small_optimizer(
        client: &CpuClient,
        device: &numr::runtime::cpu::CpuDevice,
        config: ShardedOptimizerConfig,
    ) -> ShardedOptimizer<CpuRuntime, FlatAdamW<CpuRuntime>> {
        let p0 = f16_param(client, device, &[1.0, 2.0, 3.0]);
        let p1 = f16_param(client, device, &[4.0, 5.0]);
        ShardedOptimizer::new(
            client,
            Arc::new(NoOpCommunicator),
            None,
            vec![vec![p0, p1]],
            FlatAdamW::new(FlatAdamWConfig {
                lr: 0.1,
                weight_decay: 0.0,
                ..Default::default()
            }),
            config,
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_non_f16_params() {
        let (client, device) = cpu_setup();
        let p = Tensor::<CpuRuntime>::from_slice(&[1.0f32], &[1], &device);
        let result = ShardedOptimizer::new(
            &client,
            Arc::new(NoOpCommunicator),
            None,
            vec![vec![p]],
            FlatAdamW::<CpuRuntime>::new(FlatAdamWConfig::default()),
            ShardedOptimizerConfig::default(),
        );
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_rejects_empty_groups() {
        let (client, _device) = cpu_setup();
        let result = ShardedOptimizer::new(
            &client,
            Arc::new(NoOpCommunicator),
            None,
            vec![vec![]],
            FlatAdamW::<CpuRuntime>::new(FlatAdamWConfig::default()),
            ShardedOptimizerConfig::default(),
        );
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_rejects_partition_grad_with_accumulation() {
        let (client, device) = cpu_setup();
        let p = f16_param(&client, &device, &[1.0]);
        let config = ShardedOptimizerConfig {
            partition_grad: true,
            grad_accumulation: true,
            ..Default::default()
        };
        let result = ShardedOptimizer::new(
            &client,
            Arc::new(NoOpCommunicator),
            None,
            vec![vec![p]],
            FlatAdamW::<CpuRuntime>::new(FlatAdamWConfig::default()),
            config,
        );
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_duplicate_grad_ready_raises() {
        let (client, device) = cpu_setup();
        let mut opt = small_optimizer(&client, &device, ShardedOptimizerConfig::default());
        let p0 = opt.param_ids(0)[0];

        let g = f16_param(&client, &device, &[0.1, 0.1, 0.1]);
        opt.grad_ready(&client, 0, p0, g.clone()).unwrap();
        opt.grad_ready(&client, 0, p0, g).unwrap();
        // Both events are queued; the duplicate is caught when the queue drains
        let err = opt.sync_grad(&client).unwrap_err();
        assert!(matches!(err, Error::Accounting { .. }));
    }

    #[test]
    fn test_grad_shape_mismatch_raises() {
        let (client, device) = cpu_setup();
        let mut opt = small_optimizer(&client, &device, ShardedOptimizerConfig::default());
        let p0 = opt.param_ids(0)[0];

        let wrong = f16_param(&client, &device, &[0.1, 0.1]);
        assert!(opt.grad_ready(&client, 0, p0, wrong).is_err());
    }

    /// Scaler small enough that scaled gradients stay representable in f16.
    fn small_scale_config() -> ShardedOptimizerConfig {
        ShardedOptimizerConfig::default().with_loss_scaler(LossScalerConfig {
            initial_scale: 16.0,
            min_scale: 1.0,
            max_scale: 32.0,
            ..Default::default()
        })
    }

    #[test]
    fn test_step_updates_working_params() {
        let (client, device) = cpu_setup();
        let mut opt = small_optimizer(&client, &device, small_scale_config());
        let ids: Vec<ParamId> = opt.param_ids(0).to_vec();
        let scale = opt.loss_scale();
        assert_eq!(scale, 16.0);

        // Gradients are announced pre-scaled, as backward would produce them
        let g0 = f16_param(&client, &device, &[1.0 * scale as f32; 3]);
        let g1 = f16_param(&client, &device, &[1.0 * scale as f32; 2]);
        opt.grad_ready(&client, 0, ids[0], g0).unwrap();
        opt.grad_ready(&client, 0, ids[1], g1).unwrap();
        opt.sync_grad(&client).unwrap();

        let before = opt.export_working_params().unwrap();
        let stepped = opt.step(&client).unwrap();
        assert!(stepped);

        let after = opt.export_working_params().unwrap();
        for id in ids {
            let b = client.cast(&before[&id], DType::F32).unwrap().to_vec::<f32>();
            let a = client.cast(&after[&id], DType::F32).unwrap().to_vec::<f32>();
            assert_ne!(a, b, "{id} should change after step");
        }
    }

    #[test]
    fn test_overflow_skips_step_and_preserves_params() {
        let (client, device) = cpu_setup();
        let mut opt = small_optimizer(&client, &device, ShardedOptimizerConfig::default());
        let ids: Vec<ParamId> = opt.param_ids(0).to_vec();
        let scale_before = opt.loss_scale();

        let bad = f16_param(&client, &device, &[f32::NAN, 1.0, 1.0]);
        let good = f16_param(&client, &device, &[1.0, 1.0]);
        opt.grad_ready(&client, 0, ids[0], bad).unwrap();
        opt.grad_ready(&client, 0, ids[1], good).unwrap();
        opt.sync_grad(&client).unwrap();

        let before = opt.export_working_params().unwrap();
        let stepped = opt.step(&client).unwrap();
        assert!(!stepped, "overflow must skip the step");

        let after = opt.export_working_params().unwrap();
        for id in ids {
            let b = client.cast(&before[&id], DType::F32).unwrap().to_vec::<f32>();
            let a = client.cast(&after[&id], DType::F32).unwrap().to_vec::<f32>();
            assert_eq!(a, b, "params must be unchanged after a skipped step");
        }
        // Default hysteresis is 2: the first overflow only consumes a token
        assert_eq!(opt.loss_scale(), scale_before);

        // A second overflow backs the scale off
        let ids: Vec<ParamId> = opt.param_ids(0).to_vec();
        let bad = f16_param(&client, &device, &[f32::INFINITY, 1.0, 1.0]);
        let good = f16_param(&client, &device, &[1.0, 1.0]);
        opt.grad_ready(&client, 0, ids[0], bad).unwrap();
        opt.grad_ready(&client, 0, ids[1], good).unwrap();
        opt.sync_grad(&client).unwrap();
        assert!(!opt.step(&client).unwrap());
        assert_eq!(opt.loss_scale(), scale_before * 0.5);
    }

    #[test]
    fn test_bucket_flush_at_boundary() {
        let (client, device) = cpu_setup();
        // Bucket of 4 elements: p0 (3 elems) fits, p1 (2 elems) forces a flush
        let config = ShardedOptimizerConfig::default().with_reduce_bucket_size(4);
        let mut opt = small_optimizer(&client, &device, config);
        let ids: Vec<ParamId> = opt.param_ids(0).to_vec();

        let g0 = f16_param(&client, &device, &[0.1, 0.2, 0.3]);
        opt.grad_ready(&client, 0, ids[0], g0).unwrap();
        let g1 = f16_param(&client, &device, &[0.4, 0.5]);
        opt.grad_ready(&client, 0, ids[1], g1).unwrap();
        opt.sync_grad(&client).unwrap();

        // Both params reduced exactly once despite the mid-sequence flush
        for &id in &ids {
            assert_eq!(opt.grad_store.num_slices(0, id), 1);
        }
    }

    #[test]
    fn test_export_working_params_shapes() {
        let (client, device) = cpu_setup();
        let opt = small_optimizer(&client, &device, ShardedOptimizerConfig::default());
        let params = opt.export_working_params().unwrap();
        assert_eq!(params.len(), 2);
        let ids = opt.param_ids(0);
        assert_eq!(params[&ids[0]].shape(), &[3]);
        assert_eq!(params[&ids[1]].shape(), &[2]);
    }

    #[test]
    fn test_zero_grad_clears_everything() {
        let (client, device) = cpu_setup();
        let mut opt = small_optimizer(&client, &device, ShardedOptimizerConfig::default());
        let p0 = opt.param_ids(0)[0];

        let g = f16_param(&client, &device, &[0.1, 0.1, 0.1]);
        opt.grad_ready(&client, 0, p0, g).unwrap();
        opt.zero_grad();
        assert!(opt.grad_queue.is_empty());
        assert!(opt.bucket_store.is_empty());
    }
}
