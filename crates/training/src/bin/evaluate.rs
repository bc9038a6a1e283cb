use std::path::PathBuf;

use clap::Parser;
use model::MultimodalTransformer;
use tracing::info;
use training::{
    checkpoint::{apply_model_weights, load_checkpoint},
    error::TrainingError,
    evaluate,
    labels::session,
    logging::init_tracing,
    overrides::{apply_overrides, OverrideArg},
    BlockingDataLoader, CrossEntropyLoss, DeviceSpec, SessionDataLoader, TrainingConfig,
};

fn main() {
    if let Err(err) = run() {
        eprintln!("evaluation failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Evaluate a saved session checkpoint", long_about = None)]
struct Args {
    #[arg(long, value_name = "PATH", help = "Checkpoint manifest (.json) written by training")]
    checkpoint: PathBuf,

    #[arg(short, long, value_name = "PATH", help = "Config the checkpoint was trained with")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "DIR")]
    data_path: Option<PathBuf>,

    #[arg(long, value_name = "NAME", help = "Split to evaluate (default: dev_XX of the session)")]
    split: Option<String>,

    #[arg(long, value_name = "DIR", help = "Where to write the report (default: next to the checkpoint)")]
    output: Option<PathBuf>,

    #[arg(long, value_name = "DEVICE")]
    device: Option<String>,

    #[arg(long = "override", value_name = "KEY=VALUE")]
    overrides: Vec<OverrideArg>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let config = match &args.config {
        Some(path) => TrainingConfig::load(path)?,
        None => TrainingConfig::default(),
    };
    let mut config = apply_overrides(config, &args.overrides)?;
    if let Some(path) = &args.data_path {
        config.data.data_path = path.clone();
    }
    if let Some(device) = &args.device {
        config.runtime.device = device.clone();
    }
    config.validate()?;

    let checkpoint = load_checkpoint(&args.checkpoint)?;
    let manifest = &checkpoint.manifest;
    let session = session(manifest.session_id)?;
    if session.label_set.name != manifest.label_set {
        return Err(TrainingError::initialization(format!(
            "checkpoint label set {} does not match session {} (label set {})",
            manifest.label_set, session.id, session.label_set.name
        )));
    }
    let fingerprint = config.fingerprint()?;
    if fingerprint != manifest.config_sha256 {
        info!("config differs from the one recorded in the checkpoint");
    }

    let device = DeviceSpec::parse(&config.runtime.device)?.create()?;
    let model_config = config.model_config(session.num_classes);
    let mut model = MultimodalTransformer::new(model_config, &device)
        .map_err(|err| TrainingError::initialization(err.to_string()))?;
    apply_model_weights(&model, &checkpoint.weights_path)?;

    let split = args.split.clone().unwrap_or_else(|| session.dev_split());
    let loader = SessionDataLoader::for_split(&config, &session, &split, &device, false)?;
    let mut loader = BlockingDataLoader::new(loader);

    let output = args.output.clone().unwrap_or_else(|| {
        args.checkpoint
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    });
    let test_name = format!("Session{}_{}_", session.id, split);
    let outcome = evaluate(
        &mut model,
        &mut loader,
        &CrossEntropyLoss::new(),
        &test_name,
        &output,
        &session.label_set,
    )?;

    info!(
        session = session.id,
        split = %split,
        loss = %format!("{:.4}", outcome.loss),
        f1 = %format!("{:.4}", outcome.f1),
        accuracy = %format!("{:.4}", outcome.summary.accuracy),
        report = %outcome.report_path.display(),
        "evaluation finished"
    );
    Ok(())
}
