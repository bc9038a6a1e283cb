use std::path::{Path, PathBuf};

use candle_core::Tensor;
use model::MultimodalTransformer;
use serde::Serialize;

use crate::{
    checkpoint::write_json,
    data::{BlockingDataLoader, SessionBatch, SessionDataLoader},
    error::to_runtime_error,
    labels::LabelSet,
    loss::CrossEntropyLoss,
    metrics::{EvaluationMetrics, EvaluationSummary},
    TrainingError,
};

/// Prefix for per-epoch evaluation artefacts, e.g. `Session3_epoch2_`.
pub fn test_name(session_id: u32, epoch: usize) -> String {
    format!("Session{session_id}_epoch{epoch}_")
}

#[derive(Debug, Clone)]
pub struct EvaluationOutcome {
    pub loss: f64,
    /// Support-weighted F1.
    pub f1: f64,
    pub summary: EvaluationSummary,
    pub report_path: PathBuf,
}

#[derive(Debug, Serialize)]
struct ClassReport<'a> {
    name: &'a str,
    precision: f64,
    recall: f64,
    f1: f64,
    support: u64,
}

#[derive(Debug, Serialize)]
struct EvaluationReport<'a> {
    test_name: &'a str,
    label_set: &'a str,
    loss: f64,
    accuracy: f64,
    macro_f1: f64,
    weighted_f1: f64,
    samples: u64,
    classes: Vec<ClassReport<'a>>,
    confusion_matrix: &'a [Vec<u64>],
}

pub(crate) fn forward_batch(
    model: &MultimodalTransformer,
    batch: &SessionBatch,
) -> Result<Tensor, TrainingError> {
    model
        .forward(
            batch.audio.as_ref(),
            batch.text.as_ref(),
            batch.audio_mask.as_ref(),
            batch.text_mask.as_ref(),
        )
        .map(|output| output.logits)
        .map_err(to_runtime_error)
}

/// Runs `model` over the whole split with dropout disabled and writes
/// `{save_path}/{test_name}report.json`. The model's training flag is
/// restored afterwards.
pub fn evaluate(
    model: &mut MultimodalTransformer,
    loader: &mut BlockingDataLoader<SessionDataLoader>,
    loss_fn: &CrossEntropyLoss,
    test_name: &str,
    save_path: &Path,
    label_set: &LabelSet,
) -> Result<EvaluationOutcome, TrainingError> {
    let was_training = model.is_training();
    model.set_training(false);
    let result = run_evaluation(model, loader, loss_fn, label_set.len());
    model.set_training(was_training);
    let summary = result?;

    std::fs::create_dir_all(save_path)?;
    let report_path = save_path.join(format!("{test_name}report.json"));
    let names = label_set.class_names();
    let report = EvaluationReport {
        test_name,
        label_set: label_set.name,
        loss: summary.average_loss,
        accuracy: summary.accuracy,
        macro_f1: summary.macro_f1,
        weighted_f1: summary.weighted_f1,
        samples: summary.samples,
        classes: names
            .iter()
            .zip(&summary.per_class)
            .map(|(name, stats)| ClassReport {
                name,
                precision: stats.precision,
                recall: stats.recall,
                f1: stats.f1,
                support: stats.support,
            })
            .collect(),
        confusion_matrix: summary.confusion.rows(),
    };
    write_json(&report_path, &report)?;

    Ok(EvaluationOutcome {
        loss: summary.average_loss,
        f1: summary.weighted_f1,
        summary,
        report_path,
    })
}

fn run_evaluation(
    model: &MultimodalTransformer,
    loader: &mut BlockingDataLoader<SessionDataLoader>,
    loss_fn: &CrossEntropyLoss,
    classes: usize,
) -> Result<EvaluationSummary, TrainingError> {
    loader.get_mut().start_epoch(0);
    let mut metrics = EvaluationMetrics::new(classes);

    while let Some(batch) = loader.next_batch()? {
        let logits = forward_batch(model, &batch)?.detach();
        let output = loss_fn.compute(&logits, &batch.labels)?;
        let truths = batch.labels.to_vec1::<u32>().map_err(to_runtime_error)?;
        let predictions = output
            .predictions
            .to_vec1::<u32>()
            .map_err(to_runtime_error)?;
        metrics.update(output.metrics.average_loss() as f64, &truths, &predictions);
    }

    metrics
        .finalize()
        .ok_or_else(|| TrainingError::data("evaluation split produced no batches"))
}
