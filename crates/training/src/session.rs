use std::{fs, path::PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::{
    checkpoint::write_json,
    config::DeviceSpec,
    trainer::{SessionRun, SessionTrainer},
    TrainingConfig, TrainingError,
};

pub const CONFIG_FILENAME: &str = "config.json";
pub const SUMMARY_FILENAME: &str = "sessions_summary.json";

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub sessions: Vec<SessionRun>,
    pub interrupted: bool,
    pub summary_path: PathBuf,
}

/// Trains the selected sessions one after another, each with a fresh model.
/// The summary file is rewritten after every session so partial runs still
/// leave a record.
pub fn run_sessions<F>(
    config: &TrainingConfig,
    mut should_stop: F,
) -> Result<RunSummary, TrainingError>
where
    F: FnMut() -> bool,
{
    config.validate()?;
    let sessions = config.sessions()?;
    let device = DeviceSpec::parse(&config.runtime.device)?.create()?;
    info!(device = ?device, sessions = sessions.len(), "starting run");

    let save_path = &config.runtime.save_path;
    fs::create_dir_all(save_path)?;
    fs::write(save_path.join(CONFIG_FILENAME), config.to_json_pretty()?)?;

    let summary_path = save_path.join(SUMMARY_FILENAME);
    let mut runs = Vec::with_capacity(sessions.len());
    let mut interrupted = false;

    for session in sessions {
        if should_stop() {
            interrupted = true;
            break;
        }
        let mut trainer = SessionTrainer::new(config, session, &device)?;
        let run = trainer.train(&mut should_stop)?;
        match (run.loss, run.f1) {
            (Some(loss), Some(f1)) => info!(
                session = run.session,
                epoch = run.epoch,
                loss = %format!("{loss:.4}"),
                f1 = %format!("{f1:.4}"),
                "session finished"
            ),
            _ => warn!(session = run.session, "session finished without evaluation"),
        }
        interrupted = run.interrupted;
        runs.push(run);
        write_json(&summary_path, &runs)?;
        if interrupted {
            break;
        }
    }

    if runs.is_empty() {
        write_json(&summary_path, &runs)?;
    }

    Ok(RunSummary {
        sessions: runs,
        interrupted,
        summary_path,
    })
}
