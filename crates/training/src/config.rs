use candle_core::Device;
use model::MultimodalConfig;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{
    error::to_runtime_error,
    labels::{parse_session_selection, SessionSpec},
    TrainingError,
};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub model: ModelHyperparameters,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }
        if self.data.max_len_audio == 0 {
            errors.push("data.max_len_audio must be greater than 0".to_string());
        }
        if self.data.n_mfcc == 0 {
            errors.push("data.n_mfcc must be greater than 0".to_string());
        }
        if self.data.text_dim == 0 {
            errors.push("data.text_dim must be greater than 0".to_string());
        }

        let model = &self.model;
        if model.only_audio && model.only_text {
            errors.push("model.only_audio and model.only_text are mutually exclusive".to_string());
        }
        if model.n_layers == 0 {
            errors.push("model.n_layers must be greater than 0".to_string());
        }
        if model.n_heads == 0 || model.d_model == 0 {
            errors.push("model.d_model and model.n_heads must be greater than 0".to_string());
        } else if model.d_model % model.n_heads != 0 {
            errors.push(format!(
                "model.d_model ({}) must be divisible by model.n_heads ({})",
                model.d_model, model.n_heads
            ));
        }
        for (label, value) in [
            ("model.attn_dropout", model.attn_dropout),
            ("model.relu_dropout", model.relu_dropout),
            ("model.emb_dropout", model.emb_dropout),
            ("model.res_dropout", model.res_dropout),
            ("model.out_dropout", model.out_dropout),
        ] {
            if !(0.0..1.0).contains(&value) {
                errors.push(format!("{label} must be in [0, 1) (got {value})"));
            }
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }
        if self.optimizer.epsilon <= 0.0 {
            errors.push("optimizer.epsilon must be greater than 0".to_string());
        }
        if self.optimizer.clip <= 0.0 {
            errors.push("optimizer.clip must be greater than 0".to_string());
        }
        if !(0.0..1.0).contains(&self.optimizer.label_smoothing) {
            errors.push("optimizer.label_smoothing must be in [0, 1)".to_string());
        }

        if self.scheduler.epochs == 0 {
            errors.push("scheduler.epochs must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.scheduler.warmup_percent) {
            errors.push("scheduler.warmup_percent must be in [0, 1]".to_string());
        }
        if self.scheduler.min_lr < 0.0 {
            errors.push("scheduler.min_lr must be >= 0".to_string());
        }
        if self.scheduler.min_lr > self.optimizer.learning_rate {
            errors.push("scheduler.min_lr cannot exceed optimizer.learning_rate".to_string());
        }

        if self.runtime.logging_steps == 0 {
            errors.push("runtime.logging_steps must be greater than 0".to_string());
        }
        if self.runtime.save_path.as_os_str().is_empty() {
            errors.push("runtime.save_path must not be empty".to_string());
        }
        if let Err(err) = DeviceSpec::parse(&self.runtime.device) {
            errors.push(err.to_string());
        }
        if let Err(err) = parse_session_selection(&self.runtime.sessions) {
            errors.push(err.to_string());
        }
        if let Some(tensorboard) = &self.runtime.tensorboard {
            if tensorboard.flush_every_n == 0 {
                errors.push("runtime.tensorboard.flush_every_n must be greater than 0".to_string());
            }
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    pub fn apply_base_path(&mut self, base: &Path) {
        self.data.apply_base_path(base);
        self.runtime.apply_base_path(base);
    }

    /// Model hyperparameters for a session with `n_classes` outputs.
    pub fn model_config(&self, n_classes: usize) -> MultimodalConfig {
        let model = &self.model;
        MultimodalConfig {
            n_layers: model.n_layers,
            n_heads: model.n_heads,
            n_classes,
            only_audio: model.only_audio,
            only_text: model.only_text,
            d_audio_orig: self.data.n_mfcc,
            d_text_orig: self.data.text_dim,
            d_model: model.d_model,
            attn_dropout: model.attn_dropout,
            relu_dropout: model.relu_dropout,
            emb_dropout: model.emb_dropout,
            res_dropout: model.res_dropout,
            out_dropout: model.out_dropout,
            attn_mask: model.attn_mask,
        }
    }

    pub fn sessions(&self) -> Result<Vec<SessionSpec>, TrainingError> {
        parse_session_selection(&self.runtime.sessions)
    }

    pub fn to_json_pretty(&self) -> Result<String, TrainingError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// SHA-256 of the canonical JSON form, recorded in checkpoint manifests.
    pub fn fingerprint(&self) -> Result<String, TrainingError> {
        let encoded = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&encoded)))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DataConfig {
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_len_audio")]
    pub max_len_audio: usize,
    #[serde(default = "default_n_mfcc")]
    pub n_mfcc: usize,
    #[serde(default = "default_text_dim")]
    pub text_dim: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
            batch_size: default_batch_size(),
            max_len_audio: default_max_len_audio(),
            n_mfcc: default_n_mfcc(),
            text_dim: default_text_dim(),
        }
    }
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.data_path, base);
    }

    pub fn split_path(&self, split: &str) -> PathBuf {
        self.data_path.join(format!("{split}.safetensors"))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelHyperparameters {
    #[serde(default = "default_n_layers")]
    pub n_layers: usize,
    #[serde(default = "default_n_heads")]
    pub n_heads: usize,
    #[serde(default = "default_d_model")]
    pub d_model: usize,
    #[serde(default)]
    pub only_audio: bool,
    #[serde(default)]
    pub only_text: bool,
    #[serde(default = "default_dropout")]
    pub attn_dropout: f32,
    #[serde(default = "default_dropout")]
    pub relu_dropout: f32,
    #[serde(default = "default_dropout")]
    pub emb_dropout: f32,
    #[serde(default = "default_dropout")]
    pub res_dropout: f32,
    #[serde(default = "default_dropout")]
    pub out_dropout: f32,
    #[serde(default = "default_true")]
    pub attn_mask: bool,
}

impl Default for ModelHyperparameters {
    fn default() -> Self {
        Self {
            n_layers: default_n_layers(),
            n_heads: default_n_heads(),
            d_model: default_d_model(),
            only_audio: false,
            only_text: false,
            attn_dropout: default_dropout(),
            relu_dropout: default_dropout(),
            emb_dropout: default_dropout(),
            res_dropout: default_dropout(),
            out_dropout: default_dropout(),
            attn_mask: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f32,
    #[serde(default = "default_beta1")]
    pub beta1: f32,
    #[serde(default = "default_beta2")]
    pub beta2: f32,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f32,
    /// Maximum global gradient norm.
    #[serde(default = "default_clip")]
    pub clip: f32,
    #[serde(default = "default_weight_decay_exclude")]
    pub weight_decay_exclude: Vec<String>,
    #[serde(default)]
    pub label_smoothing: f32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            clip: default_clip(),
            weight_decay_exclude: default_weight_decay_exclude(),
            label_smoothing: 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub strategy: LearningRateSchedule,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_warmup_percent")]
    pub warmup_percent: f64,
    #[serde(default)]
    pub min_lr: f32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: LearningRateSchedule::default(),
            epochs: default_epochs(),
            warmup_percent: default_warmup_percent(),
            min_lr: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LearningRateSchedule {
    #[default]
    Linear,
    Cosine,
    Constant,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_save_path")]
    pub save_path: PathBuf,
    #[serde(default = "default_logging_steps")]
    pub logging_steps: usize,
    /// Session selection such as `"1-5,8"`; empty selects all sessions.
    #[serde(default, deserialize_with = "deserialize_selection")]
    pub sessions: String,
    #[serde(default = "default_true")]
    pub progress_bars: bool,
    #[serde(default)]
    pub tensorboard: Option<TensorBoardConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            device: default_device(),
            save_path: default_save_path(),
            logging_steps: default_logging_steps(),
            sessions: String::new(),
            progress_bars: true,
            tensorboard: None,
        }
    }
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.save_path, base);
        if let Some(tensorboard) = self.tensorboard.as_mut() {
            absolutize_in_place(&mut tensorboard.log_dir, base);
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TensorBoardConfig {
    pub log_dir: PathBuf,
    #[serde(default = "default_tensorboard_flush")]
    pub flush_every_n: usize,
}

/// Where tensors live during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    Auto,
    Cpu,
    Cuda(usize),
    Metal,
}

impl DeviceSpec {
    pub fn parse(value: &str) -> Result<Self, TrainingError> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "" | "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "metal" | "mps" => Ok(Self::Metal),
            "cuda" | "gpu" => Ok(Self::Cuda(0)),
            other => match other.strip_prefix("cuda:") {
                Some(ordinal) => ordinal.parse().map(Self::Cuda).map_err(|_| {
                    TrainingError::validation(vec![format!(
                        "runtime.device has an invalid cuda ordinal '{ordinal}'"
                    )])
                }),
                None => Err(TrainingError::validation(vec![format!(
                    "runtime.device '{value}' is not one of auto, cpu, cuda[:N], metal"
                )])),
            },
        }
    }

    /// Builds the device. `Auto` prefers metal, then cuda, then the cpu.
    pub fn create(self) -> Result<Device, TrainingError> {
        match self {
            Self::Cpu => Ok(Device::Cpu),
            Self::Cuda(ordinal) => Device::new_cuda(ordinal).map_err(to_runtime_error),
            Self::Metal => Device::new_metal(0).map_err(to_runtime_error),
            Self::Auto => {
                if let Ok(device) = Device::new_metal(0) {
                    return Ok(device);
                }
                if let Ok(device) = Device::new_cuda(0) {
                    return Ok(device);
                }
                Ok(Device::Cpu)
            }
        }
    }
}

/// Accepts `sessions = 3` as well as `sessions = "3-5"`.
fn deserialize_selection<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Selection {
        Text(String),
        Single(u32),
    }

    Ok(match Selection::deserialize(deserializer)? {
        Selection::Text(text) => text,
        Selection::Single(id) => id.to_string(),
    })
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_data_path() -> PathBuf {
    PathBuf::from("./data")
}

fn default_batch_size() -> usize {
    128
}

fn default_max_len_audio() -> usize {
    400
}

fn default_n_mfcc() -> usize {
    40
}

fn default_text_dim() -> usize {
    768
}

fn default_n_layers() -> usize {
    2
}

fn default_n_heads() -> usize {
    2
}

fn default_d_model() -> usize {
    40
}

fn default_dropout() -> f32 {
    0.3
}

fn default_true() -> bool {
    true
}

fn default_learning_rate() -> f32 {
    2e-5
}

fn default_weight_decay() -> f32 {
    0.01
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.999
}

fn default_adam_eps() -> f32 {
    1e-8
}

fn default_clip() -> f32 {
    0.8
}

fn default_weight_decay_exclude() -> Vec<String> {
    vec!["bias".to_string(), "norm".to_string()]
}

fn default_epochs() -> usize {
    5
}

fn default_warmup_percent() -> f64 {
    0.1
}

fn default_seed() -> u64 {
    1
}

fn default_device() -> String {
    "auto".to_string()
}

fn default_save_path() -> PathBuf {
    PathBuf::from("./result")
}

fn default_logging_steps() -> usize {
    1
}

fn default_tensorboard_flush() -> usize {
    20
}
