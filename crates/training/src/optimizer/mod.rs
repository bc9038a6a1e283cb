use candle_core::{backprop::GradStore, Tensor, Var};

use crate::{config, error::to_runtime_error, TrainingError};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl From<&config::OptimizerConfig> for AdamWConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            learning_rate: value.learning_rate as f64,
            beta1: value.beta1 as f64,
            beta2: value.beta2 as f64,
            epsilon: value.epsilon as f64,
            weight_decay: value.weight_decay as f64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainerOptimizerOptions {
    /// Gradients are rescaled so their global L2 norm does not exceed this.
    pub clip_global_norm: Option<f64>,
    /// Parameter names containing any of these skip weight decay.
    pub weight_decay_exclude: Vec<String>,
}

impl Default for TrainerOptimizerOptions {
    fn default() -> Self {
        Self {
            clip_global_norm: None,
            weight_decay_exclude: vec!["bias".to_string(), "norm".to_string()],
        }
    }
}

impl From<&config::OptimizerConfig> for TrainerOptimizerOptions {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            clip_global_norm: Some(value.clip as f64),
            weight_decay_exclude: value.weight_decay_exclude.clone(),
        }
    }
}

/// Outcome of a single optimizer update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepStats {
    /// Global gradient norm before clipping.
    pub grad_norm: f64,
    pub clipped: bool,
    pub learning_rate: f64,
}

/// AdamW with decoupled weight decay over named model parameters.
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: AdamWConfig,
    params: Vec<ParameterSlot>,
    step: usize,
    clip_global_norm: Option<f64>,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    first_moment: Tensor,
    second_moment: Tensor,
    apply_weight_decay: bool,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: AdamWConfig,
        options: TrainerOptimizerOptions,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }
        if let Some(max_norm) = options.clip_global_norm {
            if max_norm <= 0.0 {
                return Err(TrainingError::initialization(
                    "gradient clipping norm must be greater than zero",
                ));
            }
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let first_moment = tensor.zeros_like().map_err(to_runtime_error)?;
            let second_moment = tensor.zeros_like().map_err(to_runtime_error)?;
            let apply_weight_decay =
                should_apply_weight_decay(&name, &options.weight_decay_exclude);

            params.push(ParameterSlot {
                name,
                param: var,
                first_moment,
                second_moment,
                apply_weight_decay,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
            clip_global_norm: options.clip_global_norm,
        })
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    /// Names of parameters that receive weight decay.
    pub fn decayed_parameters(&self) -> Vec<&str> {
        self.params
            .iter()
            .filter(|slot| slot.apply_weight_decay)
            .map(|slot| slot.name.as_str())
            .collect()
    }

    /// Clips the gradients in `grads` and applies one AdamW update.
    /// Parameters without a gradient are left untouched.
    pub fn step(&mut self, grads: &GradStore) -> Result<StepStats, TrainingError> {
        let mut processed = Vec::with_capacity(self.params.len());
        let mut total_norm_sq = 0.0;
        for (index, slot) in self.params.iter().enumerate() {
            if let Some(grad) = grads.get(slot.param.as_tensor()) {
                let norm_sq = grad
                    .sqr()
                    .and_then(|g| g.sum_all())
                    .and_then(|g| g.to_vec0::<f32>())
                    .map_err(to_runtime_error)? as f64;
                total_norm_sq += norm_sq;
                processed.push((index, grad.clone()));
            }
        }

        let grad_norm = total_norm_sq.sqrt();
        if !grad_norm.is_finite() {
            return Err(TrainingError::runtime(format!(
                "non-finite gradient norm {grad_norm} at optimizer step {}",
                self.step + 1
            )));
        }

        let mut clipped = false;
        if let Some(max_norm) = self.clip_global_norm {
            if grad_norm > max_norm {
                let scale = max_norm / (grad_norm + EPS);
                for (_, grad) in &mut processed {
                    *grad = grad.affine(scale, 0.0).map_err(to_runtime_error)?;
                }
                clipped = true;
            }
        }

        if !processed.is_empty() {
            self.step += 1;
            for (index, grad) in processed {
                self.update_parameter(index, &grad)
                    .map_err(to_runtime_error)?;
            }
        }

        Ok(StepStats {
            grad_norm,
            clipped,
            learning_rate: self.config.learning_rate,
        })
    }

    fn update_parameter(&mut self, index: usize, grad: &Tensor) -> candle_core::Result<()> {
        let cfg = self.config;
        let step = self.step as i32;
        let scale_m = 1.0 / (1.0 - cfg.beta1.powi(step)).max(EPS);
        let scale_v = 1.0 / (1.0 - cfg.beta2.powi(step)).max(EPS);
        let slot = &mut self.params[index];

        let m = (slot.first_moment.affine(cfg.beta1, 0.0)? + grad.affine(1.0 - cfg.beta1, 0.0)?)?;
        let v = (slot.second_moment.affine(cfg.beta2, 0.0)?
            + grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?)?;

        let denom = v.affine(scale_v, 0.0)?.sqrt()?.affine(1.0, cfg.epsilon)?;
        let update = m
            .affine(scale_m, 0.0)?
            .div(&denom)?
            .affine(cfg.learning_rate, 0.0)?;

        let current = slot.param.as_tensor();
        let base = if slot.apply_weight_decay && cfg.weight_decay != 0.0 {
            current.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)?
        } else {
            current.clone()
        };
        slot.param.set(&base.sub(&update)?)?;

        slot.first_moment = m;
        slot.second_moment = v;
        Ok(())
    }
}

fn should_apply_weight_decay(name: &str, exclusions: &[String]) -> bool {
    !exclusions
        .iter()
        .any(|pattern| !pattern.is_empty() && name.contains(pattern.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    fn options(clip: Option<f64>) -> TrainerOptimizerOptions {
        TrainerOptimizerOptions {
            clip_global_norm: clip,
            ..TrainerOptimizerOptions::default()
        }
    }

    fn adamw(lr: f64) -> AdamWConfig {
        AdamWConfig {
            learning_rate: lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }

    #[test]
    fn step_reports_pre_clip_norm() -> candle_core::Result<()> {
        let device = Device::Cpu;
        let weight = Var::from_tensor(&Tensor::new(&[3f32, 4.0], &device)?)?;
        let mut optimizer = TrainerOptimizer::new(
            vec![("proj.weight".to_string(), weight.clone())],
            adamw(0.1),
            options(Some(1.0)),
        )
        .expect("optimizer");

        // d(sum(w^2))/dw = 2w = [6, 8] with norm 10
        let loss = weight.as_tensor().sqr()?.sum_all()?;
        let grads = loss.backward()?;
        let stats = optimizer.step(&grads).expect("step");

        assert!((stats.grad_norm - 10.0).abs() < 1e-4);
        assert!(stats.clipped);
        assert!((stats.learning_rate - 0.1).abs() < 1e-12);
        assert_eq!(optimizer.steps_taken(), 1);
        let updated = weight.as_tensor().to_vec1::<f32>()?;
        assert!(updated[0] < 3.0 && updated[1] < 4.0);
        Ok(())
    }

    #[test]
    fn weight_decay_skips_excluded_names() {
        let device = Device::Cpu;
        let make = || Var::zeros(2, candle_core::DType::F32, &device).expect("var");
        let optimizer = TrainerOptimizer::new(
            vec![
                ("out_layer.weight".to_string(), make()),
                ("out_layer.bias".to_string(), make()),
                ("audio_encoder.final_norm.weight".to_string(), make()),
            ],
            adamw(1e-3),
            options(None),
        )
        .expect("optimizer");

        assert_eq!(optimizer.decayed_parameters(), vec!["out_layer.weight"]);
    }
}
