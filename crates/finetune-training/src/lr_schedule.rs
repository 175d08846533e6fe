//! Learning rate policies.
//!
//! The rate is a pure function of the epoch, recomputed before every
//! training epoch:
//! - `cos`: half-cosine decay from the base rate to zero over the run
//! - `exp`: multiply by 0.96 every epoch
//! - `fixed`: constant

use finetune_core::LrPolicy;
use std::f64::consts::PI;

/// Decay factor of the `exp` policy
pub const EXP_GAMMA: f64 = 0.96;
/// Epochs per `exp` decay step
pub const EXP_STEP: usize = 1;

#[derive(Debug, Clone, Copy)]
pub struct LearningRateScheduler {
    policy: LrPolicy,
    base_lr: f64,
    n_epoch: usize,
}

impl LearningRateScheduler {
    pub fn new(policy: LrPolicy, base_lr: f64, n_epoch: usize) -> Self {
        Self {
            policy,
            base_lr,
            n_epoch,
        }
    }

    pub fn policy(&self) -> LrPolicy {
        self.policy
    }

    /// Learning rate for `epoch`
    pub fn lr_at(&self, epoch: usize) -> f64 {
        match self.policy {
            LrPolicy::Cos => {
                let progress = epoch as f64 / self.n_epoch.max(1) as f64;
                0.5 * self.base_lr * (1.0 + (PI * progress).cos())
            }
            LrPolicy::Exp => self.base_lr * EXP_GAMMA.powi((epoch / EXP_STEP) as i32),
            LrPolicy::Fixed => self.base_lr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_endpoints() {
        let scheduler = LearningRateScheduler::new(LrPolicy::Cos, 0.1, 150);
        assert!((scheduler.lr_at(0) - 0.1).abs() < 1e-12);
        assert!((scheduler.lr_at(75) - 0.05).abs() < 1e-12);
        assert!(scheduler.lr_at(150).abs() < 1e-12);
    }

    #[test]
    fn test_exponential_decay() {
        let scheduler = LearningRateScheduler::new(LrPolicy::Exp, 0.1, 150);
        assert_eq!(scheduler.lr_at(0), 0.1);
        assert!((scheduler.lr_at(2) - 0.1 * 0.96 * 0.96).abs() < 1e-12);
        for epoch in 0..20 {
            assert!(scheduler.lr_at(epoch + 1) < scheduler.lr_at(epoch));
        }
    }

    #[test]
    fn test_fixed() {
        let scheduler = LearningRateScheduler::new(LrPolicy::Fixed, 0.01, 10);
        assert!((0..10).all(|e| scheduler.lr_at(e) == 0.01));
    }
}
