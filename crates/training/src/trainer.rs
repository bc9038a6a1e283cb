use candle_core::Device;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use model::MultimodalTransformer;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    checkpoint::{self, CheckpointDescriptor, SaveRequest},
    data::{BlockingDataLoader, SessionBatch, SessionDataLoader},
    error::to_runtime_error,
    evaluation::{self, forward_batch, EvaluationOutcome},
    labels::SessionSpec,
    logging::{Logger, LoggingSettings},
    loss::{CrossEntropyLoss, LossOutput},
    metrics::{LossWindow, TrainingMetrics},
    optimizer::{AdamWConfig, TrainerOptimizer, TrainerOptimizerOptions},
    scheduler::{LRScheduler, SchedulerConfig, StepBudget},
    TrainingConfig, TrainingError,
};

/// Result of training one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRun {
    pub session: u32,
    pub label_set: String,
    pub num_classes: usize,
    /// Last evaluated epoch, 0 when no epoch completed.
    pub epoch: usize,
    pub loss: Option<f64>,
    pub f1: Option<f64>,
    pub global_step: usize,
    pub checkpoint: Option<std::path::PathBuf>,
    pub interrupted: bool,
}

/// Owns everything needed to train one session from scratch: its loaders,
/// a freshly initialised model, optimizer and schedule.
pub struct SessionTrainer<'a> {
    config: &'a TrainingConfig,
    session: SessionSpec,
    train_loader: BlockingDataLoader<SessionDataLoader>,
    dev_loader: BlockingDataLoader<SessionDataLoader>,
    model: MultimodalTransformer,
    optimizer: TrainerOptimizer,
    scheduler: Box<dyn LRScheduler>,
    budget: StepBudget,
    loss: CrossEntropyLoss,
    /// Dev splits are scored without label smoothing.
    eval_loss: CrossEntropyLoss,
    metrics: TrainingMetrics,
    logger: Logger,
    global_step: usize,
}

impl<'a> SessionTrainer<'a> {
    pub fn new(
        config: &'a TrainingConfig,
        session: SessionSpec,
        device: &Device,
    ) -> Result<Self, TrainingError> {
        if let Err(err) = device.set_seed(config.runtime.seed) {
            debug!("device rng not seeded, dropout masks will vary between runs: {err}");
        }

        let train_loader =
            SessionDataLoader::for_split(config, &session, &session.train_split(), device, true)?;
        let dev_loader =
            SessionDataLoader::for_split(config, &session, &session.dev_split(), device, false)?;
        info!(
            session = session.id,
            label_set = session.label_set.name,
            classes = session.num_classes,
            train_samples = train_loader.dataset().len(),
            dev_samples = dev_loader.dataset().len(),
            "session data loaded"
        );

        let model_config = config.model_config(session.num_classes);
        if model_config.n_classes != session.label_set.len() {
            return Err(TrainingError::initialization(format!(
                "session {} expects {} classes but label set {} has {}",
                session.id,
                model_config.n_classes,
                session.label_set.name,
                session.label_set.len()
            )));
        }
        let seed = init_seed(config.runtime.seed, session.id);
        let model = MultimodalTransformer::new_seeded(model_config, device, seed)
            .map_err(to_runtime_error)?;

        let named_parameters = model.parameters();
        debug!(tensors = named_parameters.len(), "optimizer parameters");
        let optimizer = TrainerOptimizer::new(
            named_parameters,
            AdamWConfig::from(&config.optimizer),
            TrainerOptimizerOptions::from(&config.optimizer),
        )?;

        let scheduler_config = SchedulerConfig::from_training_config(
            &config.scheduler,
            config.optimizer.learning_rate as f64,
            train_loader.len(),
        )?;
        let budget = scheduler_config.budget;
        let scheduler = scheduler_config.build()?;

        let loss = CrossEntropyLoss::new().with_label_smoothing(config.optimizer.label_smoothing)?;
        let logger = Logger::new(&LoggingSettings::from_runtime(&config.runtime), session.id)?;

        Ok(Self {
            config,
            session,
            train_loader: BlockingDataLoader::new(train_loader),
            dev_loader: BlockingDataLoader::new(dev_loader),
            model,
            optimizer,
            scheduler,
            budget,
            loss,
            eval_loss: CrossEntropyLoss::new(),
            metrics: TrainingMetrics::new(),
            logger,
            global_step: 0,
        })
    }

    pub fn model(&self) -> &MultimodalTransformer {
        &self.model
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn budget(&self) -> StepBudget {
        self.budget
    }

    /// Trains every epoch, evaluating after each one, then writes the final
    /// checkpoint. `should_stop` is polled between steps.
    pub fn train<F>(&mut self, mut should_stop: F) -> Result<SessionRun, TrainingError>
    where
        F: FnMut() -> bool,
    {
        let epochs = self.config.scheduler.epochs;
        let save_path = self.config.runtime.save_path.clone();
        info!(
            session = self.session.id,
            total_steps = self.budget.total_steps,
            warmup_steps = self.budget.warmup_steps,
            "training session"
        );

        let bars = ProgressBars::new(self.config.runtime.progress_bars, epochs, self.session.id)?;
        let mut last: Option<EvaluationOutcome> = None;
        let mut last_epoch = 0;
        let mut interrupted = false;

        for epoch in 1..=epochs {
            self.train_loader.get_mut().start_epoch(epoch);
            let step_bar = bars.epoch_bar(self.train_loader.get_ref().len(), epoch)?;
            let completed = self.train_epoch(&step_bar, &mut should_stop)?;
            step_bar.finish_and_clear();
            if !completed {
                interrupted = true;
                warn!(session = self.session.id, epoch, "training interrupted");
                break;
            }

            let test_name = evaluation::test_name(self.session.id, epoch);
            let outcome = evaluation::evaluate(
                &mut self.model,
                &mut self.dev_loader,
                &self.eval_loss,
                &test_name,
                &save_path,
                &self.session.label_set,
            )?;
            self.logger
                .log_evaluation(epoch, self.global_step, &outcome.summary);
            bars.epochs.inc(1);
            last_epoch = epoch;
            last = Some(outcome);
        }
        bars.epochs.finish_and_clear();
        self.logger.flush();

        let checkpoint = match &last {
            Some(outcome) => Some(self.save_final_checkpoint(last_epoch, outcome)?),
            None => None,
        };

        Ok(SessionRun {
            session: self.session.id,
            label_set: self.session.label_set.name.to_string(),
            num_classes: self.session.num_classes,
            epoch: last_epoch,
            loss: last.as_ref().map(|o| o.loss),
            f1: last.as_ref().map(|o| o.f1),
            global_step: self.global_step,
            checkpoint: checkpoint.map(|c| c.weights_path),
            interrupted,
        })
    }

    /// Returns `false` when `should_stop` fired before the epoch finished.
    fn train_epoch<F>(&mut self, bar: &ProgressBar, should_stop: &mut F) -> Result<bool, TrainingError>
    where
        F: FnMut() -> bool,
    {
        self.model.set_training(true);
        let mut window = LossWindow::default();
        loop {
            if should_stop() {
                return Ok(false);
            }
            let Some(batch) = self.train_loader.next_batch()? else {
                break;
            };
            let step_loss = self.train_step(&batch, &mut window)?;
            bar.set_message(format!("loss {step_loss:.4}"));
            bar.inc(1);
        }
        if let Some(mean) = window.epoch_mean() {
            debug!(session = self.session.id, epoch_loss = mean, "epoch finished");
        }
        Ok(true)
    }

    fn train_step(
        &mut self,
        batch: &SessionBatch,
        window: &mut LossWindow,
    ) -> Result<f64, TrainingError> {
        let logits = forward_batch(&self.model, batch)?;
        let LossOutput { loss, metrics, .. } = self.loss.compute(&logits, &batch.labels)?;
        let step_loss = metrics.average_loss() as f64;
        if !step_loss.is_finite() {
            return Err(TrainingError::runtime(format!(
                "non-finite loss at session {} step {}",
                self.session.id,
                self.global_step + 1
            )));
        }

        let grads = loss.backward().map_err(to_runtime_error)?;
        let lr = self.scheduler.step();
        self.optimizer.set_learning_rate(lr);
        let stats = self.optimizer.step(&grads)?;
        self.global_step += 1;

        window.push(step_loss);
        let snapshot = self
            .metrics
            .record_step(batch.size as u64, step_loss, stats.grad_norm);
        if self.global_step % self.config.runtime.logging_steps == 0 {
            if let Some(mean_loss) = window.take_mean() {
                self.logger
                    .log_training_step(self.global_step, mean_loss, &stats, &snapshot);
            }
        }
        Ok(step_loss)
    }

    fn save_final_checkpoint(
        &self,
        epoch: usize,
        outcome: &EvaluationOutcome,
    ) -> Result<CheckpointDescriptor, TrainingError> {
        let descriptor = checkpoint::save_checkpoint(SaveRequest {
            save_path: &self.config.runtime.save_path,
            config: self.config,
            session: &self.session,
            model: &self.model,
            epoch,
            loss: outcome.loss,
            f1: outcome.f1,
            global_step: self.global_step,
        })?;
        info!(
            session = self.session.id,
            path = %descriptor.weights_path.display(),
            "saved checkpoint"
        );
        Ok(descriptor)
    }
}

/// Parameter initialisation seed of one session within a run.
pub fn init_seed(run_seed: u64, session_id: u32) -> u64 {
    run_seed.wrapping_add(u64::from(session_id))
}

struct ProgressBars {
    enabled: bool,
    multi: MultiProgress,
    epochs: ProgressBar,
}

impl ProgressBars {
    fn new(enabled: bool, epochs: usize, session_id: u32) -> Result<Self, TrainingError> {
        let multi = MultiProgress::new();
        let bar = if enabled {
            let bar = multi.add(ProgressBar::new(epochs as u64));
            bar.set_style(style("Session {msg} [{elapsed_precise}] epoch {pos}/{len}")?);
            bar.set_message(session_id.to_string());
            bar
        } else {
            ProgressBar::hidden()
        };
        Ok(Self {
            enabled,
            multi,
            epochs: bar,
        })
    }

    fn epoch_bar(&self, steps: usize, epoch: usize) -> Result<ProgressBar, TrainingError> {
        if !self.enabled {
            return Ok(ProgressBar::hidden());
        }
        let bar = self.multi.add(ProgressBar::new(steps as u64));
        bar.set_style(
            style("  epoch {prefix} {bar:40.cyan/blue} {pos}/{len} {msg} ({eta})")?
                .progress_chars("=>-"),
        );
        bar.set_prefix(epoch.to_string());
        Ok(bar)
    }
}

fn style(template: &str) -> Result<ProgressStyle, TrainingError> {
    ProgressStyle::with_template(template)
        .map_err(|err| TrainingError::initialization(format!("invalid progress template: {err}")))
}
