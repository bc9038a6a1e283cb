use std::fs;

use anyhow::Result;
use tempfile::tempdir;
use training::{config::LearningRateSchedule, DeviceSpec, TrainingConfig, TrainingError};

#[test]
fn defaults_match_reference_hyperparameters() {
    let config = TrainingConfig::default();
    assert_eq!(config.data.batch_size, 128);
    assert_eq!(config.data.max_len_audio, 400);
    assert_eq!(config.data.n_mfcc, 40);
    assert_eq!(config.model.d_model, 40);
    assert_eq!(config.model.n_layers, 2);
    assert!(config.model.attn_mask);
    assert!((config.optimizer.learning_rate - 2e-5).abs() < 1e-12);
    assert!((config.optimizer.clip - 0.8).abs() < 1e-6);
    assert_eq!(config.scheduler.epochs, 5);
    assert_eq!(config.scheduler.strategy, LearningRateSchedule::Linear);
    assert_eq!(config.runtime.seed, 1);
    assert_eq!(config.runtime.logging_steps, 1);
    assert!(config.validate().is_ok());
}

#[test]
fn toml_paths_resolve_against_config_directory() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("train.toml");
    fs::write(
        &path,
        r#"
[data]
data_path = "pkls"
batch_size = 16

[scheduler]
strategy = "cosine"
epochs = 3

[runtime]
save_path = "out"
sessions = 7
"#,
    )?;

    let config = TrainingConfig::load(&path)?;
    assert_eq!(config.data.data_path, dir.path().join("pkls"));
    assert_eq!(config.runtime.save_path, dir.path().join("out"));
    assert_eq!(config.data.batch_size, 16);
    assert_eq!(config.scheduler.strategy, LearningRateSchedule::Cosine);
    assert_eq!(config.sessions()?.len(), 1);
    Ok(())
}

#[test]
fn validation_collects_every_problem() {
    let mut config = TrainingConfig::default();
    config.model.only_audio = true;
    config.model.only_text = true;
    config.model.d_model = 41;
    config.data.batch_size = 0;
    config.runtime.device = "tpu".to_string();

    match config.validate() {
        Err(TrainingError::Validation(errors)) => {
            assert!(errors.len() >= 4, "{errors:?}");
            assert!(errors.iter().any(|e| e.contains("mutually exclusive")));
        }
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[test]
fn device_spec_parsing() {
    assert_eq!(DeviceSpec::parse("auto").expect("auto"), DeviceSpec::Auto);
    assert_eq!(DeviceSpec::parse("CPU").expect("cpu"), DeviceSpec::Cpu);
    assert_eq!(DeviceSpec::parse("cuda:1").expect("cuda"), DeviceSpec::Cuda(1));
    assert!(DeviceSpec::parse("cuda:x").is_err());
}

#[test]
fn fingerprint_tracks_content() -> Result<()> {
    let a = TrainingConfig::default();
    let mut b = TrainingConfig::default();
    assert_eq!(a.fingerprint()?, b.fingerprint()?);
    b.runtime.seed = 2;
    assert_ne!(a.fingerprint()?, b.fingerprint()?);
    Ok(())
}
