use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }
}

#[derive(Debug)]
pub struct TrainingMetrics {
    step_timer: Instant,
    start_time: Instant,
    samples_processed: u64,
    loss_ema: ExponentialMovingAverage,
    throughput_ema: ExponentialMovingAverage,
    grad_norm_ema: ExponentialMovingAverage,
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            step_timer: now,
            start_time: now,
            samples_processed: 0,
            loss_ema: ExponentialMovingAverage::new(0.1),
            throughput_ema: ExponentialMovingAverage::new(0.1),
            grad_norm_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    pub fn record_step(&mut self, samples: u64, loss: f64, grad_norm: f64) -> StepSnapshot {
        let now = Instant::now();
        let step_duration = now.duration_since(self.step_timer);
        self.step_timer = now;

        self.samples_processed = self.samples_processed.saturating_add(samples);
        let step_samples_per_sec = if step_duration > Duration::ZERO {
            samples as f64 / step_duration.as_secs_f64()
        } else {
            0.0
        };

        StepSnapshot {
            loss: self.loss_ema.update(loss),
            samples_per_sec: self.throughput_ema.update(step_samples_per_sec),
            grad_norm: self.grad_norm_ema.update(grad_norm),
            total_samples: self.samples_processed,
            wall_time: now.duration_since(self.start_time),
        }
    }
}

/// Smoothed view of the training run after one optimizer step.
#[derive(Debug, Clone)]
pub struct StepSnapshot {
    /// EMA of the step loss.
    pub loss: f64,
    pub samples_per_sec: f64,
    /// EMA of the pre-clip gradient norm.
    pub grad_norm: f64,
    pub total_samples: u64,
    pub wall_time: Duration,
}

/// Running loss sum with a mark at the last log line, so each log reports
/// the mean loss of the steps since the previous one.
#[derive(Debug, Default, Clone)]
pub struct LossWindow {
    total: f64,
    steps: usize,
    logged_total: f64,
    logged_steps: usize,
}

impl LossWindow {
    pub fn push(&mut self, loss: f64) {
        self.total += loss;
        self.steps += 1;
    }

    /// Mean loss since the last call, or `None` when no step was recorded.
    pub fn take_mean(&mut self) -> Option<f64> {
        let steps = self.steps - self.logged_steps;
        if steps == 0 {
            return None;
        }
        let mean = (self.total - self.logged_total) / steps as f64;
        self.logged_total = self.total;
        self.logged_steps = self.steps;
        Some(mean)
    }

    pub fn epoch_mean(&self) -> Option<f64> {
        (self.steps > 0).then(|| self.total / self.steps as f64)
    }
}

/// `counts[truth][predicted]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfusionMatrix {
    counts: Vec<Vec<u64>>,
}

impl ConfusionMatrix {
    pub fn new(classes: usize) -> Self {
        Self {
            counts: vec![vec![0; classes]; classes],
        }
    }

    pub fn classes(&self) -> usize {
        self.counts.len()
    }

    /// Pairs with a class outside the matrix are ignored.
    pub fn record(&mut self, truth: usize, predicted: usize) {
        if let Some(row) = self.counts.get_mut(truth) {
            if let Some(cell) = row.get_mut(predicted) {
                *cell += 1;
            }
        }
    }

    pub fn record_batch(&mut self, truths: &[u32], predictions: &[u32]) {
        for (&truth, &predicted) in truths.iter().zip(predictions) {
            self.record(truth as usize, predicted as usize);
        }
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().flatten().sum()
    }

    pub fn rows(&self) -> &[Vec<u64>] {
        &self.counts
    }

    pub fn class_stats(&self, class: usize) -> ClassStats {
        let true_positive = self.counts[class][class];
        let support: u64 = self.counts[class].iter().sum();
        let predicted: u64 = self.counts.iter().map(|row| row[class]).sum();
        let precision = ratio(true_positive, predicted);
        let recall = ratio(true_positive, support);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        ClassStats {
            precision,
            recall,
            f1,
            support,
        }
    }

    pub fn accuracy(&self) -> f64 {
        let correct: u64 = (0..self.classes()).map(|c| self.counts[c][c]).sum();
        ratio(correct, self.total())
    }

    /// Unweighted mean F1 over classes that occur in either truth or predictions.
    pub fn macro_f1(&self) -> f64 {
        let present: Vec<f64> = (0..self.classes())
            .filter(|&c| {
                self.counts[c].iter().sum::<u64>() > 0 || self.counts.iter().any(|r| r[c] > 0)
            })
            .map(|c| self.class_stats(c).f1)
            .collect();
        if present.is_empty() {
            0.0
        } else {
            present.iter().sum::<f64>() / present.len() as f64
        }
    }

    /// Support-weighted mean F1.
    pub fn weighted_f1(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        (0..self.classes())
            .map(|c| {
                let stats = self.class_stats(c);
                stats.f1 * stats.support as f64
            })
            .sum::<f64>()
            / total as f64
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClassStats {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: u64,
}

/// Sample-weighted loss accumulator paired with a confusion matrix.
#[derive(Debug)]
pub struct EvaluationMetrics {
    loss_sum: f64,
    sample_count: u64,
    confusion: ConfusionMatrix,
}

impl EvaluationMetrics {
    pub fn new(classes: usize) -> Self {
        Self {
            loss_sum: 0.0,
            sample_count: 0,
            confusion: ConfusionMatrix::new(classes),
        }
    }

    pub fn update(&mut self, loss: f64, truths: &[u32], predictions: &[u32]) {
        let samples = truths.len() as u64;
        self.loss_sum += loss * samples as f64;
        self.sample_count += samples;
        self.confusion.record_batch(truths, predictions);
    }

    pub fn finalize(self) -> Option<EvaluationSummary> {
        if self.sample_count == 0 {
            return None;
        }
        let per_class = (0..self.confusion.classes())
            .map(|c| self.confusion.class_stats(c))
            .collect();
        Some(EvaluationSummary {
            average_loss: self.loss_sum / self.sample_count as f64,
            accuracy: self.confusion.accuracy(),
            macro_f1: self.confusion.macro_f1(),
            weighted_f1: self.confusion.weighted_f1(),
            samples: self.sample_count,
            per_class,
            confusion: self.confusion,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationSummary {
    pub average_loss: f64,
    pub accuracy: f64,
    pub macro_f1: f64,
    pub weighted_f1: f64,
    pub samples: u64,
    pub per_class: Vec<ClassStats>,
    pub confusion: ConfusionMatrix,
}
