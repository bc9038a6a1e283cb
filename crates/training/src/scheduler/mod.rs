use std::f64::consts::PI;

use crate::{config, TrainingError};

pub trait LRScheduler: Send {
    /// Advances one optimizer step and returns the rate for that step.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    fn steps_taken(&self) -> usize;
}

/// Step budget of one session run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepBudget {
    pub total_steps: usize,
    pub warmup_steps: usize,
}

impl StepBudget {
    /// `total = round(batches_per_epoch * epochs)`, `warmup = round(total * warmup_percent)`.
    pub fn new(batches_per_epoch: usize, epochs: usize, warmup_percent: f64) -> Self {
        let total_steps = (batches_per_epoch as f64 * epochs as f64).round() as usize;
        Self {
            total_steps,
            warmup_steps: compute_warmup_steps(total_steps, warmup_percent),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    pub decay: Decay,
    pub base_lr: f64,
    pub min_lr: f64,
    pub budget: StepBudget,
}

/// Shape of the schedule once warmup is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decay {
    Linear,
    Cosine,
    Constant,
}

impl From<config::LearningRateSchedule> for Decay {
    fn from(value: config::LearningRateSchedule) -> Self {
        match value {
            config::LearningRateSchedule::Linear => Decay::Linear,
            config::LearningRateSchedule::Cosine => Decay::Cosine,
            config::LearningRateSchedule::Constant => Decay::Constant,
        }
    }
}

impl SchedulerConfig {
    pub fn from_training_config(
        cfg: &config::SchedulerConfig,
        base_lr: f64,
        batches_per_epoch: usize,
    ) -> Result<Self, TrainingError> {
        let budget = StepBudget::new(batches_per_epoch, cfg.epochs, cfg.warmup_percent);
        if budget.total_steps == 0 {
            return Err(TrainingError::initialization(
                "scheduler requires total_steps greater than zero",
            ));
        }
        Ok(Self {
            decay: cfg.strategy.into(),
            base_lr,
            min_lr: cfg.min_lr as f64,
            budget,
        })
    }

    pub fn build(self) -> Result<Box<dyn LRScheduler>, TrainingError> {
        Ok(Box::new(WarmupSchedule::new(self)?))
    }
}

/// Linear warmup from `base_lr / warmup_steps` up to `base_lr`, followed by
/// the configured decay towards `min_lr` at `total_steps`.
#[derive(Debug, Clone)]
pub struct WarmupSchedule {
    decay: Decay,
    base_lr: f64,
    min_lr: f64,
    total_steps: usize,
    warmup_steps: usize,
    step: usize,
    current_lr: f64,
}

impl WarmupSchedule {
    pub fn new(config: SchedulerConfig) -> Result<Self, TrainingError> {
        if config.base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        if config.min_lr < 0.0 || config.min_lr > config.base_lr {
            return Err(TrainingError::initialization(
                "scheduler min_lr must be in [0, base_lr]",
            ));
        }
        Ok(Self {
            decay: config.decay,
            base_lr: config.base_lr,
            min_lr: config.min_lr,
            total_steps: config.budget.total_steps.max(1),
            warmup_steps: config.budget.warmup_steps,
            step: 0,
            current_lr: 0.0,
        })
    }

    /// Rate used by optimizer step `step` (zero based). Step `warmup_steps - 1`
    /// is the first to run at `base_lr` and decay starts on the next one.
    pub fn lr_at(&self, step: usize) -> f64 {
        let completed = step.saturating_add(1);
        if completed < self.warmup_steps {
            return self.base_lr * completed as f64 / self.warmup_steps as f64;
        }

        if self.decay == Decay::Constant || self.total_steps <= self.warmup_steps {
            return self.base_lr;
        }

        let effective = (completed - self.warmup_steps) as f64;
        let span = (self.total_steps - self.warmup_steps) as f64;
        let progress = (effective / span).clamp(0.0, 1.0);
        let factor = match self.decay {
            Decay::Linear => 1.0 - progress,
            Decay::Cosine => 0.5 * (1.0 + f64::cos(PI * progress)),
            Decay::Constant => 1.0,
        };
        self.min_lr + (self.base_lr - self.min_lr) * factor
    }
}

impl LRScheduler for WarmupSchedule {
    fn step(&mut self) -> f64 {
        let lr = self.lr_at(self.step);
        self.current_lr = lr;
        self.step = self.step.saturating_add(1);
        lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn steps_taken(&self) -> usize {
        self.step
    }
}

fn compute_warmup_steps(total_steps: usize, proportion: f64) -> usize {
    if total_steps == 0 {
        return 0;
    }
    let clamped = proportion.clamp(0.0, 1.0);
    let steps = (clamped * total_steps as f64).round() as usize;
    steps.min(total_steps)
}
