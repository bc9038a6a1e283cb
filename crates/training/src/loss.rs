use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::{error::to_runtime_error, TrainingError};

/// Classification cross entropy over `(batch, classes)` logits with optional
/// label smoothing.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss {
    label_smoothing: f32,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label_smoothing(mut self, smoothing: f32) -> Result<Self, TrainingError> {
        if !(0.0..1.0).contains(&smoothing) {
            return Err(TrainingError::initialization(
                "label smoothing must be in [0, 1) for cross entropy",
            ));
        }
        self.label_smoothing = smoothing;
        Ok(self)
    }

    /// `targets` holds one class index per row; `(batch, 1)` is squeezed.
    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        let (batch, classes) = match logits.dims() {
            &[batch, classes] => (batch, classes),
            dims => {
                return Err(TrainingError::runtime(format!(
                    "cross entropy expects (batch, classes) logits, got {dims:?}"
                )))
            }
        };
        if batch == 0 || classes == 0 {
            return Err(TrainingError::runtime(
                "cross entropy received an empty batch",
            ));
        }

        let targets = match targets.dims() {
            [n] if *n == batch => targets.clone(),
            [n, 1] if *n == batch => targets.squeeze(1).map_err(to_runtime_error)?,
            dims => {
                return Err(TrainingError::runtime(format!(
                    "targets of shape {dims:?} do not match {batch} logits rows"
                )))
            }
        };
        let targets = match targets.dtype() {
            DType::U32 => targets,
            DType::I64 | DType::U8 => targets.to_dtype(DType::U32).map_err(to_runtime_error)?,
            dtype => {
                return Err(TrainingError::runtime(format!(
                    "unsupported target dtype {dtype:?} for cross entropy"
                )))
            }
        };
        let targets = targets
            .to_device(logits.device())
            .map_err(to_runtime_error)?;

        let max_target = targets
            .max(0)
            .and_then(|t| t.to_vec0::<u32>())
            .map_err(to_runtime_error)?;
        if max_target as usize >= classes {
            return Err(TrainingError::runtime(format!(
                "target class {max_target} is out of range for {classes} classes"
            )));
        }

        self.compute_checked(logits, &targets, batch)
            .map_err(to_runtime_error)
    }

    fn compute_checked(
        &self,
        logits: &Tensor,
        targets: &Tensor,
        batch: usize,
    ) -> candle_core::Result<LossOutput> {
        let logits = logits.to_dtype(DType::F32)?;
        let log_probs = ops::log_softmax(&logits, D::Minus1)?;
        let nll = log_probs
            .gather(&targets.unsqueeze(1)?, 1)?
            .squeeze(1)?
            .neg()?;

        let per_sample = if self.label_smoothing > 0.0 {
            let smoothing = self.label_smoothing as f64;
            let uniform = log_probs.mean(1)?.neg()?;
            (nll.affine(1.0 - smoothing, 0.0)? + uniform.affine(smoothing, 0.0)?)?
        } else {
            nll
        };
        let loss = per_sample.mean_all()?;
        let average_loss = loss.to_vec0::<f32>()?;

        let predictions = logits.argmax(D::Minus1)?;
        let correct = predictions
            .eq(targets)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_vec0::<f32>()?
            .round() as usize;

        Ok(LossOutput {
            loss,
            predictions,
            metrics: LossMetrics {
                average_loss,
                samples: batch,
                correct,
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Scalar mean loss, attached to the autograd graph.
    pub loss: Tensor,
    /// Argmax class per row.
    pub predictions: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone)]
pub struct LossMetrics {
    average_loss: f32,
    samples: usize,
    correct: usize,
}

impl LossMetrics {
    pub fn average_loss(&self) -> f32 {
        self.average_loss
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn correct(&self) -> usize {
        self.correct
    }

    pub fn accuracy(&self) -> f32 {
        if self.samples == 0 {
            0.0
        } else {
            self.correct as f32 / self.samples as f32
        }
    }
}
