use serde::{Deserialize, Serialize};

use crate::{
    config::{self, LrPolicy},
    TrainingError,
};

/// Per-epoch learning-rate policy. `step` is called once at the start of
/// every epoch; plateau schedules consume the latest validation loss.
pub trait LRScheduler: Send {
    fn step(&mut self, metric: Option<f64>) -> f64;
    fn learning_rate(&self) -> f64;
    fn state(&self) -> SchedulerState;
    fn load_state(&mut self, state: &SchedulerState);
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub last_epoch: usize,
    pub learning_rate: f64,
    #[serde(default)]
    pub best: Option<f64>,
    #[serde(default)]
    pub num_bad_epochs: usize,
}

#[derive(Debug, Clone)]
pub enum SchedulerConfig {
    Step {
        base_lr: f64,
        step_size: usize,
        gamma: f64,
    },
    Lambda {
        base_lr: f64,
        epoch_count: usize,
        niter: usize,
        niter_decay: usize,
    },
    Plateau {
        base_lr: f64,
        factor: f64,
        threshold: f64,
        patience: usize,
    },
}

impl SchedulerConfig {
    pub fn from_training_config(cfg: &config::SchedulerConfig, base_lr: f64) -> Self {
        match cfg.lr_policy {
            LrPolicy::Step => SchedulerConfig::Step {
                base_lr,
                step_size: cfg.lr_decay,
                gamma: cfg.lr_gamma,
            },
            LrPolicy::Lambda => SchedulerConfig::Lambda {
                base_lr,
                epoch_count: cfg.epoch_count,
                niter: cfg.niter,
                niter_decay: cfg.niter_decay,
            },
            LrPolicy::Plateau => SchedulerConfig::Plateau {
                base_lr,
                factor: 0.2,
                threshold: 0.01,
                patience: 5,
            },
        }
    }

    pub fn build(self) -> Result<Box<dyn LRScheduler>, TrainingError> {
        let base_lr = match self {
            SchedulerConfig::Step { base_lr, .. }
            | SchedulerConfig::Lambda { base_lr, .. }
            | SchedulerConfig::Plateau { base_lr, .. } => base_lr,
        };
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        match self {
            SchedulerConfig::Step {
                base_lr,
                step_size,
                gamma,
            } => {
                if step_size == 0 {
                    return Err(TrainingError::initialization(
                        "step scheduler requires step_size > 0",
                    ));
                }
                Ok(Box::new(StepDecay {
                    base_lr,
                    step_size,
                    gamma,
                    last_epoch: 0,
                    current_lr: base_lr,
                }))
            }
            SchedulerConfig::Lambda {
                base_lr,
                epoch_count,
                niter,
                niter_decay,
            } => Ok(Box::new(LinearDecay {
                base_lr,
                epoch_count,
                niter,
                niter_decay,
                last_epoch: 0,
                current_lr: base_lr,
            })),
            SchedulerConfig::Plateau {
                base_lr,
                factor,
                threshold,
                patience,
            } => Ok(Box::new(ReduceOnPlateau {
                factor,
                threshold,
                patience,
                last_epoch: 0,
                current_lr: base_lr,
                best: None,
                num_bad_epochs: 0,
            })),
        }
    }
}

/// `lr = base * gamma^(epoch / step_size)`.
struct StepDecay {
    base_lr: f64,
    step_size: usize,
    gamma: f64,
    last_epoch: usize,
    current_lr: f64,
}

impl LRScheduler for StepDecay {
    fn step(&mut self, _metric: Option<f64>) -> f64 {
        self.last_epoch += 1;
        let decays = (self.last_epoch / self.step_size) as i32;
        self.current_lr = self.base_lr * self.gamma.powi(decays);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn state(&self) -> SchedulerState {
        SchedulerState {
            last_epoch: self.last_epoch,
            learning_rate: self.current_lr,
            ..SchedulerState::default()
        }
    }

    fn load_state(&mut self, state: &SchedulerState) {
        self.last_epoch = state.last_epoch;
        self.current_lr = state.learning_rate;
    }
}

/// Constant for `niter` epochs, then linear decay to zero over `niter_decay`.
struct LinearDecay {
    base_lr: f64,
    epoch_count: usize,
    niter: usize,
    niter_decay: usize,
    last_epoch: usize,
    current_lr: f64,
}

impl LinearDecay {
    fn factor(&self, epoch: usize) -> f64 {
        let elapsed = (epoch + 1 + self.epoch_count) as f64 - self.niter as f64;
        (1.0 - elapsed.max(0.0) / (self.niter_decay + 1) as f64).max(0.0)
    }
}

impl LRScheduler for LinearDecay {
    fn step(&mut self, _metric: Option<f64>) -> f64 {
        self.last_epoch += 1;
        self.current_lr = self.base_lr * self.factor(self.last_epoch);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn state(&self) -> SchedulerState {
        SchedulerState {
            last_epoch: self.last_epoch,
            learning_rate: self.current_lr,
            ..SchedulerState::default()
        }
    }

    fn load_state(&mut self, state: &SchedulerState) {
        self.last_epoch = state.last_epoch;
        self.current_lr = state.learning_rate;
    }
}

/// Multiplies the rate by `factor` once the metric has not improved by a
/// relative `threshold` for more than `patience` epochs.
struct ReduceOnPlateau {
    factor: f64,
    threshold: f64,
    patience: usize,
    last_epoch: usize,
    current_lr: f64,
    best: Option<f64>,
    num_bad_epochs: usize,
}

impl LRScheduler for ReduceOnPlateau {
    fn step(&mut self, metric: Option<f64>) -> f64 {
        self.last_epoch += 1;
        let Some(metric) = metric else {
            return self.current_lr;
        };
        let improved = match self.best {
            Some(best) => metric < best * (1.0 - self.threshold),
            None => true,
        };
        if improved {
            self.best = Some(metric);
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }
        if self.num_bad_epochs > self.patience {
            self.current_lr *= self.factor;
            self.num_bad_epochs = 0;
        }
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn state(&self) -> SchedulerState {
        SchedulerState {
            last_epoch: self.last_epoch,
            learning_rate: self.current_lr,
            best: self.best,
            num_bad_epochs: self.num_bad_epochs,
        }
    }

    fn load_state(&mut self, state: &SchedulerState) {
        self.last_epoch = state.last_epoch;
        self.current_lr = state.learning_rate;
        self.best = state.best;
        self.num_bad_epochs = state.num_bad_epochs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn step_policy_decays_every_lr_decay_epochs() {
        let mut sched = SchedulerConfig::Step {
            base_lr: 2e-4,
            step_size: 10,
            gamma: 0.1,
        }
        .build()
        .unwrap();
        let rates: Vec<f64> = (1..=20).map(|_| sched.step(None)).collect();
        assert!(approx(rates[0], 2e-4));
        assert!(approx(rates[8], 2e-4));
        assert!(approx(rates[9], 2e-5));
        assert!(approx(rates[19], 2e-6));
    }

    #[test]
    fn lambda_policy_decays_linearly_after_niter() {
        let mut sched = SchedulerConfig::Lambda {
            base_lr: 1.0,
            epoch_count: 1,
            niter: 4,
            niter_decay: 4,
        }
        .build()
        .unwrap();
        let rates: Vec<f64> = (0..6).map(|_| sched.step(None)).collect();
        assert!(approx(rates[0], 1.0));
        assert!(approx(rates[1], 1.0));
        assert!(approx(rates[2], 0.8));
        assert!(approx(rates[5], 0.2));
        // Past the decay window the rate stays at zero.
        assert!(approx(sched.step(None), 0.0));
        assert!(approx(sched.step(None), 0.0));
    }

    #[test]
    fn plateau_policy_waits_for_patience() {
        let mut sched = SchedulerConfig::Plateau {
            base_lr: 1.0,
            factor: 0.2,
            threshold: 0.01,
            patience: 5,
        }
        .build()
        .unwrap();
        assert!(approx(sched.step(Some(1.0)), 1.0));
        for _ in 0..5 {
            // Within 1% of the best value: not an improvement.
            assert!(approx(sched.step(Some(0.995)), 1.0));
        }
        assert!(approx(sched.step(Some(0.995)), 0.2));
        assert!(approx(sched.step(None), 0.2));

        let state = sched.state();
        let mut restored = SchedulerConfig::Plateau {
            base_lr: 1.0,
            factor: 0.2,
            threshold: 0.01,
            patience: 5,
        }
        .build()
        .unwrap();
        restored.load_state(&state);
        assert_eq!(restored.state(), state);
    }
}
