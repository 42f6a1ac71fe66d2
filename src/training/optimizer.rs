/// Optimizer driver: Adam over the refinement partition plus the global step
///
/// Uses candle-nn's AdamW with weight decay disabled. The learning rate for
/// an update is taken from the schedule at the pre-update step, and the step
/// counter advances as part of the same call.
use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

use super::scheduler::ExponentialDecay;

/// Result of one applied update
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    /// Global step after the update
    pub step: usize,
    /// Learning rate used for the update
    pub lr: f64,
}

pub struct OptimizerDriver {
    optimizer: AdamW,
    scheduler: ExponentialDecay,
    global_step: usize,
}

impl OptimizerDriver {
    /// Create new driver
    ///
    /// # Arguments
    /// * `vars` - Trainable variables (refinement partition only)
    /// * `scheduler` - Learning rate schedule
    /// * `global_step` - Starting step (non-zero when resuming)
    pub fn new(vars: Vec<Var>, scheduler: ExponentialDecay, global_step: usize) -> candle_core::Result<Self> {
        let params = ParamsAdamW {
            lr: scheduler.get_lr_at_step(global_step),
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        };
        let optimizer = AdamW::new(vars, params)?;

        Ok(Self {
            optimizer,
            scheduler,
            global_step,
        })
    }

    /// Backward pass + parameter update, then increment the global step
    pub fn step(&mut self, loss: &Tensor) -> candle_core::Result<StepOutcome> {
        let lr = self.scheduler.get_lr_at_step(self.global_step);
        self.optimizer.set_learning_rate(lr);
        self.optimizer.backward_step(loss)?;
        self.global_step += 1;

        Ok(StepOutcome {
            step: self.global_step,
            lr,
        })
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Learning rate the next update will use
    pub fn current_lr(&self) -> f64 {
        self.scheduler.get_lr_at_step(self.global_step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::scheduler::ExponentialDecayConfig;
    use candle_core::{DType, Device};

    fn schedule() -> ExponentialDecay {
        ExponentialDecay::new(ExponentialDecayConfig {
            base_lr: 0.1,
            decay_rate: 0.5,
            decay_steps: 2,
        })
    }

    #[test]
    fn test_step_updates_only_given_vars() -> candle_core::Result<()> {
        let device = Device::Cpu;
        let trained = Var::ones((3,), DType::F32, &device)?;
        let frozen = Tensor::ones((3,), DType::F32, &device)?;

        let mut driver = OptimizerDriver::new(vec![trained.clone()], schedule(), 0)?;
        let loss = trained.as_tensor().mul(&frozen)?.sqr()?.sum_all()?;
        let outcome = driver.step(&loss)?;

        assert_eq!(outcome, StepOutcome { step: 1, lr: 0.1 });
        let moved = trained.as_tensor().to_vec1::<f32>()?;
        assert!(moved.iter().all(|v| *v < 1.0));
        assert_eq!(frozen.to_vec1::<f32>()?, vec![1.0, 1.0, 1.0]);

        Ok(())
    }

    #[test]
    fn test_lr_follows_pre_update_step() -> candle_core::Result<()> {
        let device = Device::Cpu;
        let w = Var::ones((2,), DType::F32, &device)?;
        let mut driver = OptimizerDriver::new(vec![w.clone()], schedule(), 0)?;

        let mut lrs = Vec::new();
        for _ in 0..5 {
            let loss = w.as_tensor().sqr()?.sum_all()?;
            lrs.push(driver.step(&loss)?.lr);
        }

        assert_eq!(lrs, vec![0.1, 0.1, 0.05, 0.05, 0.025]);
        assert_eq!(driver.global_step(), 5);
        assert_eq!(driver.current_lr(), 0.025);

        Ok(())
    }

    #[test]
    fn test_resume_starts_at_given_step() -> candle_core::Result<()> {
        let device = Device::Cpu;
        let w = Var::ones((2,), DType::F32, &device)?;
        let mut driver = OptimizerDriver::new(vec![w.clone()], schedule(), 4)?;

        let loss = w.as_tensor().sqr()?.sum_all()?;
        let outcome = driver.step(&loss)?;

        assert_eq!(outcome, StepOutcome { step: 5, lr: 0.025 });
        Ok(())
    }
}
