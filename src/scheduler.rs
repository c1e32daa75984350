use serde::Serialize;

/// Learning-rate policy handed to the training loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Multiply the rate by `gamma` every `step_size` epochs.
    StepLr { step_size: usize, gamma: f64 },
}

impl SchedulerKind {
    pub fn build(self, base_lr: f64) -> StepLr {
        match self {
            Self::StepLr { step_size, gamma } => StepLr::new(base_lr, step_size, gamma),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StepLr {
    base_lr: f64,
    step_size: usize,
    gamma: f64,
}

impl StepLr {
    pub fn new(base_lr: f64, step_size: usize, gamma: f64) -> Self {
        Self {
            base_lr,
            step_size: step_size.max(1),
            gamma,
        }
    }

    /// Rate for a 1-based epoch number.
    pub fn lr_at(&self, epoch: usize) -> f64 {
        let decays = epoch.saturating_sub(1) / self.step_size;
        self.base_lr * self.gamma.powi(decays as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decays_every_step_size_epochs() {
        let sched = SchedulerKind::StepLr {
            step_size: 2,
            gamma: 0.1,
        }
        .build(1.0);
        let rates: Vec<f64> = (1..=5).map(|epoch| sched.lr_at(epoch)).collect();
        let expected = [1.0, 1.0, 0.1, 0.1, 0.01];
        for (got, want) in rates.iter().zip(expected) {
            assert!((got - want).abs() < 1e-12, "{rates:?}");
        }
    }

    #[test]
    fn zero_step_size_is_clamped() {
        let sched = StepLr::new(0.5, 0, 0.5);
        assert_eq!(sched.lr_at(1), 0.5);
        assert_eq!(sched.lr_at(2), 0.25);
    }
}
