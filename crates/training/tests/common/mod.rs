#![allow(dead_code)]

use std::{collections::HashMap, path::Path};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use training::TrainingConfig;

pub const N_MFCC: usize = 4;
pub const TEXT_DIM: usize = 6;
pub const AUDIO_LEN: usize = 9;
pub const TEXT_LEN: usize = 5;

/// Writes `{dir}/{split}.safetensors` with random features and the given
/// canonical emotion codes. The last two audio frames of every sample are
/// padding.
pub fn write_split(dir: &Path, split: &str, codes: &[i64]) -> Result<()> {
    let tensors = split_tensors(codes)?;
    std::fs::create_dir_all(dir)?;
    candle_core::safetensors::save(&tensors, dir.join(format!("{split}.safetensors")))?;
    Ok(())
}

pub fn split_tensors(codes: &[i64]) -> Result<HashMap<String, Tensor>> {
    let device = Device::Cpu;
    let n = codes.len();
    let audio_mask: Vec<u8> = (0..n * AUDIO_LEN)
        .map(|i| u8::from(i % AUDIO_LEN < AUDIO_LEN - 2))
        .collect();

    let mut tensors = HashMap::new();
    tensors.insert(
        "audio".to_string(),
        Tensor::randn(0f32, 1.0, (n, AUDIO_LEN, N_MFCC), &device)?,
    );
    tensors.insert(
        "audio_mask".to_string(),
        Tensor::from_vec(audio_mask, (n, AUDIO_LEN), &device)?,
    );
    tensors.insert(
        "text".to_string(),
        Tensor::randn(0f32, 1.0, (n, TEXT_LEN, TEXT_DIM), &device)?,
    );
    tensors.insert(
        "text_mask".to_string(),
        Tensor::ones((n, TEXT_LEN), DType::U8, &device)?,
    );
    tensors.insert(
        "labels".to_string(),
        Tensor::from_vec(codes.to_vec(), (n, 1), &device)?,
    );
    Ok(tensors)
}

/// Small CPU configuration rooted at `base`.
pub fn tiny_config(base: &Path) -> TrainingConfig {
    let mut config = TrainingConfig::default();
    config.data.data_path = base.join("data");
    config.data.batch_size = 4;
    config.data.n_mfcc = N_MFCC;
    config.data.text_dim = TEXT_DIM;
    config.data.max_len_audio = 400;
    config.model.n_layers = 1;
    config.model.n_heads = 2;
    config.model.d_model = 8;
    config.optimizer.learning_rate = 1e-3;
    config.scheduler.epochs = 2;
    config.runtime.device = "cpu".to_string();
    config.runtime.save_path = base.join("result");
    config.runtime.progress_bars = false;
    config
}
