use std::{
    collections::HashMap,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::safetensors::load as load_safetensors;
use model::MultimodalTransformer;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{error::to_runtime_error, labels::SessionSpec, TrainingConfig, TrainingError};

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub session_id: u32,
    pub label_set: String,
    pub class_names: Vec<String>,
    pub epoch: usize,
    pub loss: f64,
    pub f1: f64,
    pub global_step: usize,
    pub config_sha256: String,
    pub weights: FileRecord,
}

pub struct SaveRequest<'a> {
    pub save_path: &'a Path,
    pub config: &'a TrainingConfig,
    pub session: &'a SessionSpec,
    pub model: &'a MultimodalTransformer,
    pub epoch: usize,
    pub loss: f64,
    pub f1: f64,
    pub global_step: usize,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub weights_path: PathBuf,
    pub manifest_path: PathBuf,
    pub manifest: CheckpointManifest,
}

/// `epoch{E}-loss{L:.4}-f1{F:.4}.Session{id}`, shared by the weights file
/// and its manifest.
pub fn checkpoint_stem(epoch: usize, loss: f64, f1: f64, session_id: u32) -> String {
    format!("epoch{epoch}-loss{loss:.4}-f1{f1:.4}.Session{session_id}")
}

pub fn save_checkpoint(request: SaveRequest<'_>) -> Result<CheckpointDescriptor, TrainingError> {
    fs::create_dir_all(request.save_path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            request.save_path.display()
        ))
    })?;

    let stem = checkpoint_stem(request.epoch, request.loss, request.f1, request.session.id);
    let weights_path = request.save_path.join(format!("{stem}.safetensors"));
    save_model_weights(request.model, &weights_path)?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        session_id: request.session.id,
        label_set: request.session.label_set.name.to_string(),
        class_names: request
            .session
            .label_set
            .class_names()
            .into_iter()
            .map(str::to_string)
            .collect(),
        epoch: request.epoch,
        loss: request.loss,
        f1: request.f1,
        global_step: request.global_step,
        config_sha256: request.config.fingerprint()?,
        weights: file_record(&weights_path)?,
    };

    let manifest_path = request.save_path.join(format!("{stem}.json"));
    write_json(&manifest_path, &manifest)?;

    Ok(CheckpointDescriptor {
        weights_path,
        manifest_path,
        manifest,
    })
}

/// Reads a manifest and verifies the weights file it points at.
pub fn load_checkpoint(manifest_path: &Path) -> Result<CheckpointDescriptor, TrainingError> {
    if !manifest_path.is_file() {
        return Err(TrainingError::runtime(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    let manifest: CheckpointManifest = read_json(manifest_path)?;
    if manifest.version != CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "checkpoint version {} is not supported (expected {CHECKPOINT_VERSION})",
            manifest.version
        )));
    }

    let directory = manifest_path.parent().unwrap_or_else(|| Path::new("."));
    let weights_path = directory.join(&manifest.weights.filename);
    verify_weights(&weights_path, &manifest.weights)?;

    Ok(CheckpointDescriptor {
        weights_path,
        manifest_path: manifest_path.to_path_buf(),
        manifest,
    })
}

/// Copies stored tensors into the model. Missing and unused tensors are
/// both errors.
pub fn apply_model_weights(
    model: &MultimodalTransformer,
    weights_path: &Path,
) -> Result<(), TrainingError> {
    let tensors = load_safetensors(weights_path, model.device()).map_err(to_runtime_error)?;
    let mut params_by_name: HashMap<_, _> = tensors.into_iter().collect();

    for (name, var) in model.parameters() {
        let tensor = params_by_name.remove(&name).ok_or_else(|| {
            TrainingError::runtime(format!("checkpoint missing parameter {name}"))
        })?;
        if tensor.dims() != var.as_tensor().dims() {
            return Err(TrainingError::runtime(format!(
                "checkpoint parameter {name} has shape {:?}, model expects {:?}",
                tensor.dims(),
                var.as_tensor().dims()
            )));
        }
        let tensor = tensor
            .to_dtype(var.as_tensor().dtype())
            .map_err(to_runtime_error)?;
        var.set(&tensor).map_err(to_runtime_error)?;
    }

    if !params_by_name.is_empty() {
        let mut extra = params_by_name.into_keys().collect::<Vec<_>>();
        extra.sort();
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }

    Ok(())
}

fn save_model_weights(model: &MultimodalTransformer, path: &Path) -> Result<(), TrainingError> {
    let named_parameters = model.parameters();
    if named_parameters.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    let tensors: HashMap<String, _> = named_parameters
        .into_iter()
        .map(|(name, var)| (name, var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            TrainingError::runtime(format!("non UTF-8 checkpoint name {}", path.display()))
        })?;
    Ok(FileRecord {
        filename,
        sha256: sha256_file(path)?,
        bytes: fs::metadata(path)?.len(),
    })
}

fn verify_weights(path: &Path, record: &FileRecord) -> Result<(), TrainingError> {
    if !path.is_file() {
        return Err(TrainingError::runtime(format!(
            "checkpoint weights {} are missing",
            path.display()
        )));
    }
    if sha256_file(path)? != record.sha256 {
        return Err(TrainingError::runtime(format!(
            "checkpoint weights {} do not match the manifest checksum",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut hasher = Sha256::new();
    io::copy(&mut File::open(path)?, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut data = serde_json::to_vec_pretty(value)?;
    data.push(b'\n');
    fs::write(path, data).map_err(|err| {
        TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
    })
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path)?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("malformed manifest {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::checkpoint_stem;

    #[test]
    fn stem_uses_four_decimals() {
        assert_eq!(
            checkpoint_stem(5, 1.234_567, 0.5, 12),
            "epoch5-loss1.2346-f10.5000.Session12"
        );
    }
}
