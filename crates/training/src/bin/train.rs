use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use tracing::info;
use training::{
    logging::init_tracing,
    overrides::{apply_overrides, OverrideArg},
    run_sessions, TrainingConfig, TrainingError,
};

fn main() {
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Per-session multimodal emotion classifier training", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Training config file (TOML or JSON)")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = "Directory holding train_XX/dev_XX safetensors")]
    data_path: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = "Directory for reports, checkpoints and config.json")]
    save_path: Option<PathBuf>,

    #[arg(long, value_name = "LIST", help = "Sessions to train, e.g. 1-5,8 (default: all)")]
    sessions: Option<String>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long = "lr")]
    learning_rate: Option<f32>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, value_name = "DEVICE", help = "auto, cpu, cuda[:N] or metal")]
    device: Option<String>,

    #[arg(long, conflicts_with = "only_text")]
    only_audio: bool,

    #[arg(long)]
    only_text: bool,

    #[arg(long, help = "Disable key padding masks inside attention")]
    no_attn_mask: bool,

    #[arg(long, help = "Hide progress bars")]
    no_progress: bool,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, default_value = "info", help = "Default log filter when RUST_LOG is unset")]
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
    apply_flags(&mut config, &args);
    config.validate()?;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    let summary = run_sessions(&config, || shutdown_flag.load(Ordering::Relaxed))?;
    info!(
        sessions = summary.sessions.len(),
        interrupted = summary.interrupted,
        summary = %summary.summary_path.display(),
        "run finished"
    );
    Ok(())
}

fn apply_flags(config: &mut TrainingConfig, args: &Args) {
    if let Some(path) = &args.data_path {
        config.data.data_path = path.clone();
    }
    if let Some(path) = &args.save_path {
        config.runtime.save_path = path.clone();
    }
    if let Some(sessions) = &args.sessions {
        config.runtime.sessions = sessions.clone();
    }
    if let Some(epochs) = args.epochs {
        config.scheduler.epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        config.data.batch_size = batch_size;
    }
    if let Some(lr) = args.learning_rate {
        config.optimizer.learning_rate = lr;
    }
    if let Some(seed) = args.seed {
        config.runtime.seed = seed;
    }
    if let Some(device) = &args.device {
        config.runtime.device = device.clone();
    }
    if args.only_audio {
        config.model.only_audio = true;
    }
    if args.only_text {
        config.model.only_text = true;
    }
    if args.no_attn_mask {
        config.model.attn_mask = false;
    }
    if args.no_progress {
        config.runtime.progress_bars = false;
    }
}
