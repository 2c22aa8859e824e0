//! Dynamic loss scaling for fp16 training.
//!
//! fp16's narrow exponent range underflows small gradients, so the loss is
//! multiplied by a large scale before backward and gradients divided by it
//! before the step. The scale grows while training is stable and backs off
//! on overflow, with a hysteresis band so isolated spikes don't immediately
//! shrink it.

use tracing::debug;

use crate::error::{Error, Result};

/// Dynamic loss scaler configuration.
#[derive(Debug, Clone)]
pub struct LossScalerConfig {
    pub initial_scale: f64,
    pub min_scale: f64,
    pub max_scale: f64,
    pub growth_factor: f64,
    pub backoff_factor: f64,
    pub growth_interval: u64,
    pub hysteresis: u64,
}

impl Default for LossScalerConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f64.powi(32),
            min_scale: 1.0,
            max_scale: 2f64.powi(32),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 1000,
            hysteresis: 2,
        }
    }
}

/// Loss scale state: a power-of-two scalar with growth/backoff dynamics.
///
/// Mutated only by [`update`](DynamicLossScaler::update), once per step.
pub struct DynamicLossScaler {
    scale: f64,
    config: LossScalerConfig,
    growth_step: u64,
    hysteresis_step: u64,
}

impl DynamicLossScaler {
    pub fn new(config: LossScalerConfig) -> Result<Self> {
        if config.initial_scale <= 0.0 {
            return Err(Error::Config {
                reason: format!(
                    "initial_scale must be positive, got {}",
                    config.initial_scale
                ),
            });
        }
        if config.min_scale <= 0.0 || config.min_scale > config.initial_scale {
            return Err(Error::Config {
                reason: format!(
                    "min_scale must be in (0, initial_scale], got {}",
                    config.min_scale
                ),
            });
        }
        if config.max_scale < config.initial_scale {
            return Err(Error::Config {
                reason: format!(
                    "max_scale {} is below initial_scale {}",
                    config.max_scale, config.initial_scale
                ),
            });
        }
        if config.growth_factor <= 1.0 {
            return Err(Error::Config {
                reason: format!("growth_factor must be > 1.0, got {}", config.growth_factor),
            });
        }
        if config.backoff_factor <= 0.0 || config.backoff_factor >= 1.0 {
            return Err(Error::Config {
                reason: format!(
                    "backoff_factor must be in (0, 1), got {}",
                    config.backoff_factor
                ),
            });
        }
        if config.growth_interval == 0 {
            return Err(Error::Config {
                reason: "growth_interval must be > 0".to_string(),
            });
        }
        if config.hysteresis == 0 {
            return Err(Error::Config {
                reason: "hysteresis must be > 0".to_string(),
            });
        }

        Ok(Self {
            scale: config.initial_scale,
            config,
            growth_step: 0,
            hysteresis_step: 0,
        })
    }

    /// Current loss scale. Multiply the loss by this before backward.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Scale a loss value before the backward pass.
    pub fn scale_loss(&self, loss: f64) -> f64 {
        loss * self.scale
    }

    /// Advance the scale state after a step attempt.
    ///
    /// On overflow the growth counter resets and one hysteresis token is
    /// consumed; once `hysteresis` overflows have accumulated, the scale
    /// backs off (clamped to `min_scale`). After `growth_interval` clean
    /// steps both counters reset and the scale grows (clamped to
    /// `max_scale`).
    pub fn update(&mut self, overflow: bool) {
        if overflow {
            self.growth_step = 0;
            self.hysteresis_step += 1;
            if self.hysteresis_step >= self.config.hysteresis {
                let old = self.scale;
                self.scale = (self.scale * self.config.backoff_factor).max(self.config.min_scale);
                debug!(old, new = self.scale, "loss scale backed off");
            }
        } else {
            self.growth_step += 1;
            if self.growth_step == self.config.growth_interval {
                self.growth_step = 0;
                self.hysteresis_step = 0;
                let old = self.scale;
                self.scale = (self.scale * self.config.growth_factor).min(self.config.max_scale);
                debug!(old, new = self.scale, "loss scale grew");
            }
        }
    }
}
