//! Learning rate schedules
//!
//! The pretraining run uses linear warmup into a half-cosine decay, then holds
//! the floor. Every worker evaluates the schedule at the same `global_step`,
//! so the LR sequence is identical across replicas.

use std::f64::consts::PI;

/// Learning rate as a pure function of the optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LrSchedule {
    /// Constant learning rate
    Constant { lr: f64 },
    /// Linear warmup to `max_lr`, cosine decay to `min_lr` at `max_steps`, then flat.
    WarmupCosine {
        max_lr: f64,
        min_lr: f64,
        warmup_steps: u64,
        max_steps: u64,
    },
}

impl LrSchedule {
    /// Recipe used by the trainer: floor at 10% of peak, warmup over the
    /// first 10% of steps.
    pub fn for_run(max_lr: f64, max_steps: u64) -> Self {
        LrSchedule::WarmupCosine {
            max_lr,
            min_lr: 0.1 * max_lr,
            warmup_steps: max_steps / 10,
            max_steps,
        }
    }

    /// Get the learning rate for a given step
    pub fn get_lr(&self, step: u64) -> f64 {
        match *self {
            LrSchedule::Constant { lr } => lr,

            LrSchedule::WarmupCosine {
                max_lr,
                min_lr,
                warmup_steps,
                max_steps,
            } => {
                if step < warmup_steps {
                    return max_lr * (step + 1) as f64 / warmup_steps as f64;
                }
                if step > max_steps {
                    return min_lr;
                }
                let decay_ratio = if max_steps > warmup_steps {
                    ((step - warmup_steps) as f64 / (max_steps - warmup_steps) as f64)
                        .clamp(0.0, 1.0)
                } else {
                    1.0
                };
                let coeff = 0.5 * (1.0 + (PI * decay_ratio).cos());
                min_lr + coeff * (max_lr - min_lr)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sched() -> LrSchedule {
        LrSchedule::WarmupCosine {
            max_lr: 3e-4,
            min_lr: 3e-5,
            warmup_steps: 10,
            max_steps: 100,
        }
    }

    #[test]
    fn test_constant() {
        let sched = LrSchedule::Constant { lr: 0.001 };
        assert_eq!(sched.get_lr(0), 0.001);
        assert_eq!(sched.get_lr(1000), 0.001);
    }

    #[test]
    fn test_warmup_starts_at_one_over_warmup() {
        let s = sched();
        assert!((s.get_lr(0) - 3e-5).abs() < 1e-12);
        assert!((s.get_lr(4) - 1.5e-4).abs() < 1e-12);
    }

    #[test]
    fn test_peak_at_warmup_end() {
        assert!((sched().get_lr(10) - 3e-4).abs() < 1e-12);
    }

    #[test]
    fn test_floor_at_and_after_max_steps() {
        let s = sched();
        assert!((s.get_lr(100) - 3e-5).abs() < 1e-12);
        assert_eq!(s.get_lr(101), 3e-5);
        assert_eq!(s.get_lr(10_000), 3e-5);
    }

    #[test]
    fn test_decay_is_non_increasing() {
        let s = sched();
        let mut prev = s.get_lr(10);
        for step in 11..=100 {
            let lr = s.get_lr(step);
            assert!(lr <= prev + 1e-15, "lr rose at step {step}");
            prev = lr;
        }
    }

    #[test]
    fn test_decay_midpoint() {
        // ratio 0.5 -> cos(pi/2) = 0 -> halfway between floor and peak
        let lr = sched().get_lr(55);
        assert!((lr - 1.65e-4).abs() < 1e-10);
    }

    #[test]
    fn test_max_equal_warmup_does_not_divide_by_zero() {
        let s = LrSchedule::WarmupCosine {
            max_lr: 1.0,
            min_lr: 0.1,
            warmup_steps: 5,
            max_steps: 5,
        };
        assert!((s.get_lr(5) - 0.1).abs() < 1e-12);
        assert!(s.get_lr(4).is_finite());
    }

    #[test]
    fn test_for_run_recipe() {
        let s = LrSchedule::for_run(3e-4, 95);
        assert_eq!(
            s,
            LrSchedule::WarmupCosine {
                max_lr: 3e-4,
                min_lr: 3e-4 * 0.1,
                warmup_steps: 9,
                max_steps: 95,
            }
        );
        // warmup_steps == 0 skips warmup entirely
        let short = LrSchedule::for_run(1.0, 5);
        assert!((short.get_lr(0) - 1.0).abs() < 1e-12);
    }
}
