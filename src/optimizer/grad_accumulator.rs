//! Gradient accumulation with explicit cross-worker synchronization
//!
//! A batch of `batch_size` examples is processed as `g = batch_size /
//! micro_batch_size` micro-batches. Local gradients are summed for the first
//! `g - 1` micro-batches; the last one of each group carries
//! `sync_gradients = true`, which averages the buffer and all-reduces it.
//! The optimizer steps once per group, only on a synchronized buffer, so the
//! step counter and parameters stay identical on every worker.
//!
//! ```ignore
//! for i in 0..num_micro_batches {
//!     let grads = backward(&loss, &client)?;
//!     ctrl.accumulate(&client, model.params(), grads, schedule.sync_gradients(i), &group)?;
//!     if schedule.opens_group(i + 1) {
//!         ctrl.step(&client, model.params_mut(), &mut opt, &lr, &mut state)?;
//!     }
//! }
//! ```

use crate::distributed::{ProcessGroup, all_reduce_grads};
use crate::error::{Error, Result};
use crate::nn::ParamStore;
use crate::optimizer::grad_clip::clip_grad_norm;
use crate::optimizer::lr_schedule::LrSchedule;
use crate::optimizer::traits::Optimizer;
use crate::trainer::state::TrainingState;
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::ops::{BinaryOps, ReduceOps, ScalarOps, UnaryOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::TensorId;

/// Micro-batch arithmetic for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccumulationSchedule {
    batch_size: usize,
    micro_batch_size: usize,
    grad_accum_steps: usize,
}

impl AccumulationSchedule {
    pub fn new(batch_size: usize, micro_batch_size: usize) -> Result<Self> {
        if micro_batch_size == 0 || batch_size == 0 {
            return Err(Error::ConfigError {
                reason: "batch_size and micro_batch_size must be > 0".into(),
            });
        }
        if batch_size % micro_batch_size != 0 {
            return Err(Error::ConfigError {
                reason: format!(
                    "batch_size ({batch_size}) must be a multiple of micro_batch_size ({micro_batch_size})"
                ),
            });
        }
        Ok(Self {
            batch_size,
            micro_batch_size,
            grad_accum_steps: batch_size / micro_batch_size,
        })
    }

    pub fn grad_accum_steps(&self) -> usize {
        self.grad_accum_steps
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn micro_batch_size(&self) -> usize {
        self.micro_batch_size
    }

    /// Whether micro-batch `i` closes its group and must synchronize.
    pub fn sync_gradients(&self, i: u64) -> bool {
        i % self.grad_accum_steps as u64 == self.grad_accum_steps as u64 - 1
    }

    /// Whether micro-batch `i` starts a new group.
    pub fn opens_group(&self, i: u64) -> bool {
        i % self.grad_accum_steps as u64 == 0
    }
}

/// Result of one optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// `global_step` after the update.
    pub step: u64,
    pub lr: f64,
    /// Global gradient norm before clipping.
    pub grad_norm: f64,
}

/// Owns the gradient buffer between micro-batches and the step that drains it.
pub struct GradSyncController<R: Runtime> {
    grad_accum_steps: usize,
    max_grad_norm: f64,
    buffer: Option<GradStore<R>>,
    pending: usize,
    synced: bool,
}

impl<R: Runtime<DType = DType>> GradSyncController<R> {
    pub fn new(schedule: &AccumulationSchedule, max_grad_norm: f64) -> Result<Self> {
        if max_grad_norm.is_nan() || max_grad_norm <= 0.0 {
            return Err(Error::ConfigError {
                reason: format!("grad_clip must be positive, got {max_grad_norm}"),
            });
        }
        Ok(Self {
            grad_accum_steps: schedule.grad_accum_steps(),
            max_grad_norm,
            buffer: None,
            pending: 0,
            synced: false,
        })
    }

    /// Micro-batches in the buffer since the last step.
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Add one micro-batch's gradients. With `sync_gradients`, the buffer is
    /// divided by the group size and averaged across `group`.
    pub fn accumulate<C, P>(
        &mut self,
        client: &C,
        params: &ParamStore<R>,
        grads: GradStore<R>,
        sync_gradients: bool,
        group: &P,
    ) -> Result<()>
    where
        C: RuntimeClient<R> + BinaryOps<R> + ScalarOps<R>,
        P: ProcessGroup + ?Sized,
    {
        if self.synced {
            return Err(Error::TrainingError {
                reason: "gradients already synchronized; step before accumulating the next group"
                    .into(),
            });
        }

        let mut acc = match self.buffer.take() {
            None => grads,
            Some(mut acc) => {
                for id in grads.keys().copied().collect::<Vec<TensorId>>() {
                    let Some(new_grad) = grads.get(id) else {
                        continue;
                    };
                    let summed = match acc.get(id) {
                        Some(existing) => client.add(existing, new_grad)?,
                        None => new_grad.clone(),
                    };
                    acc.insert(id, summed);
                }
                acc
            }
        };
        self.pending += 1;

        if sync_gradients {
            let scale = 1.0 / self.grad_accum_steps as f64;
            for id in acc.keys().copied().collect::<Vec<TensorId>>() {
                if let Some(grad) = acc.get(id) {
                    let scaled = client.mul_scalar(grad, scale)?;
                    acc.insert(id, scaled);
                }
            }
            all_reduce_grads(group, params, &mut acc)?;
            self.synced = true;
            tracing::trace!(micro_batches = self.pending, "gradients synchronized");
        }

        self.buffer = Some(acc);
        Ok(())
    }

    /// Apply one optimizer step from the synchronized buffer.
    ///
    /// Sets the LR for the current `global_step`, clips the global norm,
    /// updates `params`, clears the buffer and advances `global_step`.
    pub fn step<C, O>(
        &mut self,
        client: &C,
        params: &mut ParamStore<R>,
        optimizer: &mut O,
        schedule: &LrSchedule,
        state: &mut TrainingState,
    ) -> Result<StepReport>
    where
        C: RuntimeClient<R> + BinaryOps<R> + UnaryOps<R> + ScalarOps<R> + ReduceOps<R>,
        O: Optimizer<R>,
    {
        if !self.synced {
            return Err(Error::TrainingError {
                reason: format!(
                    "optimizer step requested with unsynchronized gradients ({} of {} micro-batches)",
                    self.pending, self.grad_accum_steps
                ),
            });
        }
        let mut grads = self.buffer.take().unwrap_or_else(GradStore::new);
        self.synced = false;
        self.pending = 0;

        let lr = schedule.get_lr(state.global_step);
        optimizer.set_lr(lr);

        let order: Vec<TensorId> = params.names().map(|(_, id)| id).collect();
        let grad_norm = clip_grad_norm(client, &mut grads, &order, self.max_grad_norm)?;
        optimizer.step(client, params, &grads)?;

        state.global_step += 1;
        state.optimizer_timestep = optimizer.timestep();

        Ok(StepReport {
            step: state.global_step,
            lr,
            grad_norm,
        })
    }

    /// Drop any partially accumulated gradients.
    pub fn reset(&mut self) {
        self.buffer = None;
        self.pending = 0;
        self.synced = false;
    }
}
