//! Gradient-ready event queue.
//!
//! Backward produces one "gradient ready" event per parameter; the sharded
//! optimizer drains the queue into its communication bucket. Modeling the
//! notification as explicit message passing (instead of autograd hook
//! callbacks) keeps the accumulation routine an ordinary loop with ordinary
//! error propagation.

use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::zero::ParamId;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// One parameter's gradient, announced ready for reduction.
///
/// The event owns the gradient tensor: pushing it transfers the only
/// reference into the reduction pipeline.
pub struct GradReadyEvent<R: Runtime> {
    pub group_id: usize,
    pub param_id: ParamId,
    pub grad: Tensor<R>,
}

/// Bounded single-consumer queue of gradient-ready events.
///
/// Capacity is the number of registered parameters: within one step window
/// each parameter announces at most once, so exceeding capacity means a
/// double announcement and is reported as an accounting error rather than
/// blocking.
pub struct GradReadyQueue<R: Runtime> {
    events: VecDeque<GradReadyEvent<R>>,
    capacity: usize,
}

impl<R: Runtime> GradReadyQueue<R> {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Enqueue an event. Errors when the queue is full.
    pub fn push(&mut self, event: GradReadyEvent<R>) -> Result<()> {
        if self.events.len() >= self.capacity {
            return Err(Error::Accounting {
                reason: format!(
                    "gradient-ready queue overflow (capacity {}): more events than registered parameters in one step window",
                    self.capacity
                ),
            });
        }
        self.events.push_back(event);
        Ok(())
    }

    /// Dequeue the oldest event.
    pub fn pop(&mut self) -> Option<GradReadyEvent<R>> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
