/// Exponential staircase learning rate schedule

/// Staircase decay configuration
#[derive(Debug, Clone)]
pub struct ExponentialDecayConfig {
    /// Learning rate at step 0
    pub base_lr: f64,
    /// Factor applied once every `decay_steps`
    pub decay_rate: f64,
    /// Steps between decays (one epoch)
    pub decay_steps: usize,
}

impl Default for ExponentialDecayConfig {
    fn default() -> Self {
        Self {
            base_lr: 1e-4,
            decay_rate: 0.5,
            decay_steps: 1000,
        }
    }
}

/// Exponential staircase scheduler
///
/// `lr(s) = base_lr * decay_rate^floor(s / decay_steps)`. The rate is a pure
/// function of the global step, so a resumed run sees exactly the sequence of
/// an uninterrupted one.
#[derive(Debug, Clone)]
pub struct ExponentialDecay {
    config: ExponentialDecayConfig,
}

impl ExponentialDecay {
    /// Create new scheduler; `decay_steps` of 0 is treated as 1
    pub fn new(mut config: ExponentialDecayConfig) -> Self {
        config.decay_steps = config.decay_steps.max(1);
        Self { config }
    }

    /// Get learning rate for a specific step
    pub fn get_lr_at_step(&self, step: usize) -> f64 {
        let exponent = (step / self.config.decay_steps) as i32;
        self.config.base_lr * self.config.decay_rate.powi(exponent)
    }

    pub fn decay_steps(&self) -> usize {
        self.config.decay_steps
    }
}
