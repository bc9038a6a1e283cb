mod common;

use anyhow::Result;
use candle_core::Device;
use common::{tiny_config, write_split};
use model::MultimodalTransformer;
use tempfile::tempdir;
use training::{
    checkpoint::{apply_model_weights, load_checkpoint},
    evaluate,
    labels::session,
    run_sessions,
    session::{CONFIG_FILENAME, SUMMARY_FILENAME},
    BlockingDataLoader, CrossEntropyLoss, SessionDataLoader,
};

// session 1 trains on label set B: neutral, happy, surprise
const TRAIN_CODES: [i64; 10] = [0, 1, 3, 0, 1, 3, 0, 1, 3, 0];
const DEV_CODES: [i64; 6] = [3, 1, 0, 0, 1, 3];

#[test]
fn trains_one_session_and_reloads_its_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let mut config = tiny_config(dir.path());
    config.runtime.sessions = "1".to_string();
    write_split(&config.data.data_path, "train_01", &TRAIN_CODES)?;
    write_split(&config.data.data_path, "dev_01", &DEV_CODES)?;

    let summary = run_sessions(&config, || false)?;
    assert!(!summary.interrupted);
    assert_eq!(summary.sessions.len(), 1);

    let save_path = &config.runtime.save_path;
    assert!(save_path.join(CONFIG_FILENAME).is_file());
    assert!(save_path.join(SUMMARY_FILENAME).is_file());
    assert!(save_path.join("Session1_epoch1_report.json").is_file());
    assert!(save_path.join("Session1_epoch2_report.json").is_file());

    let run = &summary.sessions[0];
    assert_eq!(run.session, 1);
    assert_eq!(run.num_classes, 3);
    assert_eq!(run.epoch, 2);
    // ceil(10 / 4) batches for two epochs
    assert_eq!(run.global_step, 6);
    let loss = run.loss.expect("evaluated loss");
    let f1 = run.f1.expect("evaluated f1");
    assert!(loss.is_finite());
    assert!((0.0..=1.0).contains(&f1));

    let weights = run.checkpoint.clone().expect("checkpoint written");
    let file_name = weights
        .file_name()
        .and_then(|name| name.to_str())
        .expect("utf-8 name")
        .to_string();
    assert!(file_name.starts_with("epoch2-loss"), "{file_name}");
    assert!(file_name.ends_with(".Session1.safetensors"), "{file_name}");

    let descriptor = load_checkpoint(&weights.with_extension("json"))?;
    assert_eq!(descriptor.manifest.session_id, 1);
    assert_eq!(descriptor.manifest.label_set, "B");
    assert_eq!(descriptor.manifest.global_step, 6);
    assert_eq!(descriptor.manifest.config_sha256, config.fingerprint()?);

    let sess = session(1)?;
    let mut model = MultimodalTransformer::new(config.model_config(sess.num_classes), &Device::Cpu)?;
    apply_model_weights(&model, &descriptor.weights_path)?;
    let mut dev = BlockingDataLoader::new(SessionDataLoader::for_split(
        &config,
        &sess,
        &sess.dev_split(),
        &Device::Cpu,
        false,
    )?);
    let outcome = evaluate(
        &mut model,
        &mut dev,
        &CrossEntropyLoss::new(),
        "Session1_reload_",
        &dir.path().join("reload"),
        &sess.label_set,
    )?;
    assert!(
        (outcome.loss - descriptor.manifest.loss).abs() < 1e-4,
        "reloaded loss {} vs saved {}",
        outcome.loss,
        descriptor.manifest.loss
    );
    assert!(outcome.report_path.is_file());

    let mut tampered = std::fs::read(&descriptor.weights_path)?;
    if let Some(last) = tampered.last_mut() {
        *last ^= 0xff;
    }
    std::fs::write(&descriptor.weights_path, tampered)?;
    assert!(load_checkpoint(&descriptor.manifest_path).is_err());
    Ok(())
}

#[test]
fn stop_request_before_first_step_leaves_no_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let mut config = tiny_config(dir.path());
    config.runtime.sessions = "1".to_string();
    write_split(&config.data.data_path, "train_01", &TRAIN_CODES)?;
    write_split(&config.data.data_path, "dev_01", &DEV_CODES)?;

    // first poll happens before the session starts
    let mut polls = 0;
    let summary = run_sessions(&config, || {
        polls += 1;
        polls > 1
    })?;
    assert!(summary.interrupted);
    assert_eq!(summary.sessions.len(), 1);
    let run = &summary.sessions[0];
    assert!(run.interrupted);
    assert_eq!(run.global_step, 0);
    assert_eq!(run.epoch, 0);
    assert!(run.checkpoint.is_none());
    assert!(run.loss.is_none());
    assert!(summary.summary_path.is_file());
    Ok(())
}

#[test]
fn missing_dev_split_fails_the_session() -> Result<()> {
    let dir = tempdir()?;
    let mut config = tiny_config(dir.path());
    config.runtime.sessions = "1".to_string();
    write_split(&config.data.data_path, "train_01", &TRAIN_CODES)?;

    let err = run_sessions(&config, || false).expect_err("dev split missing");
    assert!(err.to_string().contains("dev_01"), "{err}");
    Ok(())
}

#[test]
fn sessions_with_different_label_sets_train_back_to_back() -> Result<()> {
    let dir = tempdir()?;
    let mut config = tiny_config(dir.path());
    config.runtime.sessions = "1,18".to_string();
    config.optimizer.label_smoothing = 0.2;
    write_split(&config.data.data_path, "train_01", &TRAIN_CODES)?;
    write_split(&config.data.data_path, "dev_01", &DEV_CODES)?;
    // session 18 uses label set Q: disgust, fear, happy, neutral, sad
    write_split(&config.data.data_path, "train_18", &[4, 6, 1, 0, 5, 4, 6, 1, 0, 5])?;
    write_split(&config.data.data_path, "dev_18", &[5, 0, 1, 6, 4])?;

    let summary = run_sessions(&config, || false)?;
    assert!(!summary.interrupted);
    let shapes: Vec<(u32, &str, usize, usize)> = summary
        .sessions
        .iter()
        .map(|run| (run.session, run.label_set.as_str(), run.num_classes, run.global_step))
        .collect();
    assert_eq!(shapes, vec![(1, "B", 3, 6), (18, "Q", 5, 6)]);

    for run in &summary.sessions {
        let weights = run.checkpoint.as_ref().expect("checkpoint written");
        assert!(weights.is_file(), "{}", weights.display());
        let suffix = format!(".Session{}.safetensors", run.session);
        assert!(weights.to_string_lossy().ends_with(&suffix), "{}", weights.display());
    }

    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&summary.summary_path)?)?;
    let entries = written.as_array().expect("summary is a list of runs");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1]["session"], 18);
    assert_eq!(entries[1]["num_classes"], 5);

    // dev loss is reported without label smoothing
    let run = &summary.sessions[1];
    let weights = run.checkpoint.clone().expect("checkpoint written");
    let descriptor = load_checkpoint(&weights.with_extension("json"))?;
    let sess = session(18)?;
    let mut model = MultimodalTransformer::new(config.model_config(sess.num_classes), &Device::Cpu)?;
    apply_model_weights(&model, &descriptor.weights_path)?;
    let mut dev = BlockingDataLoader::new(SessionDataLoader::for_split(
        &config,
        &sess,
        &sess.dev_split(),
        &Device::Cpu,
        false,
    )?);
    let outcome = evaluate(
        &mut model,
        &mut dev,
        &CrossEntropyLoss::new(),
        "Session18_reload_",
        &dir.path().join("reload"),
        &sess.label_set,
    )?;
    assert!(
        (outcome.loss - descriptor.manifest.loss).abs() < 1e-4,
        "unsmoothed loss {} vs saved {}",
        outcome.loss,
        descriptor.manifest.loss
    );
    Ok(())
}
