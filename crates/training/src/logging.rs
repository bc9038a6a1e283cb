use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;
use tracing::{info, warn};
use tracing_subscriber::{fmt::time::ChronoLocal, EnvFilter};

use crate::{
    config::RuntimeConfig,
    metrics::{EvaluationSummary, StepSnapshot},
    optimizer::StepStats,
    TrainingError,
};

/// Installs the global console subscriber. `RUST_LOG` takes precedence over
/// `default_directive`. Calling this twice is harmless.
pub fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::builder()
        .parse_lossy(std::env::var("RUST_LOG").unwrap_or_else(|_| default_directive.to_string()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new("%m/%d/%Y %H:%M:%S".to_string()))
        .with_target(true)
        .try_init();
}

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_runtime(runtime: &RuntimeConfig) -> Self {
        match &runtime.tensorboard {
            Some(tb) => Self {
                tensorboard_dir: Some(tb.log_dir.clone()),
                tensorboard_flush_every_n: tb.flush_every_n.max(1),
            },
            None => Self {
                tensorboard_dir: None,
                tensorboard_flush_every_n: 1,
            },
        }
    }
}

/// Step and evaluation reporting for one session. Scalars are tagged with
/// the session id so every session lands in one event file.
pub struct Logger {
    session_id: u32,
    tensorboard: Option<EventFile>,
}

impl Logger {
    pub fn new(settings: &LoggingSettings, session_id: u32) -> Result<Self, TrainingError> {
        let tensorboard = settings
            .tensorboard_dir
            .as_ref()
            .map(|dir| EventFile::create(dir, session_id, settings.tensorboard_flush_every_n))
            .transpose()?;
        Ok(Self {
            session_id,
            tensorboard,
        })
    }

    /// `mean_loss` is the average over the steps since the last log line.
    pub fn log_training_step(
        &mut self,
        step: usize,
        mean_loss: f64,
        stats: &StepStats,
        snapshot: &StepSnapshot,
    ) {
        info!(
            session = self.session_id,
            step,
            loss = %format!("{mean_loss:.4}"),
            grad_norm = %format!("{:.3}", stats.grad_norm),
            clipped = stats.clipped,
            lr = %format!("{:.3e}", stats.learning_rate),
            samples_per_sec = %format!("{:.1}", snapshot.samples_per_sec),
            samples = snapshot.total_samples,
            elapsed = %format!("{:.1}s", snapshot.wall_time.as_secs_f64()),
            "train"
        );

        self.emit(
            step,
            &[
                ("train/loss", mean_loss),
                ("train/loss_ema", snapshot.loss),
                ("train/grad_norm", stats.grad_norm),
                ("train/grad_norm_ema", snapshot.grad_norm),
                ("train/clipped", if stats.clipped { 1.0 } else { 0.0 }),
                ("train/learning_rate", stats.learning_rate),
                ("train/samples_per_sec", snapshot.samples_per_sec),
            ],
        );
    }

    pub fn log_evaluation(&mut self, epoch: usize, step: usize, summary: &EvaluationSummary) {
        info!(
            session = self.session_id,
            epoch,
            loss = %format!("{:.4}", summary.average_loss),
            acc = %format!("{:.2}%", summary.accuracy * 100.0),
            weighted_f1 = %format!("{:.4}", summary.weighted_f1),
            macro_f1 = %format!("{:.4}", summary.macro_f1),
            samples = summary.samples,
            "eval"
        );

        self.emit(
            step,
            &[
                ("eval/loss", summary.average_loss),
                ("eval/accuracy", summary.accuracy),
                ("eval/weighted_f1", summary.weighted_f1),
                ("eval/macro_f1", summary.macro_f1),
            ],
        );
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            if let Err(err) = writer.flush() {
                warn!("tensorboard flush failed: {err}");
            }
        }
    }

    fn emit(&mut self, step: usize, scalars: &[(&str, f64)]) {
        let Some(events) = self.tensorboard.as_mut() else {
            return;
        };
        let tagged: Vec<(String, f64)> = scalars
            .iter()
            .map(|(tag, value)| (format!("session{:02}/{tag}", self.session_id), *value))
            .collect();
        if let Err(err) = events.append_scalars(step as i64, &tagged) {
            warn!("tensorboard write failed: {err}");
        }
    }
}

const FILE_VERSION: &str = "brain.Event:2";

/// Append-only TFRecord stream of `Event` protos readable by TensorBoard.
struct EventFile {
    path: PathBuf,
    out: BufWriter<File>,
    flush_every: usize,
    unflushed: usize,
}

impl EventFile {
    fn create(dir: &Path, session_id: u32, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "events.out.tfevents.{}.{}.session{:02}",
            wall_time() as u64,
            hostname(),
            session_id
        ));
        let out = BufWriter::new(File::create(&path)?);
        let mut file = Self {
            path,
            out,
            flush_every: flush_every.max(1),
            unflushed: 0,
        };
        file.append(&Event {
            wall_time: wall_time(),
            step: 0,
            file_version: Some(FILE_VERSION.to_string()),
            summary: None,
        })?;
        file.flush()?;
        Ok(file)
    }

    /// One event per call, holding every scalar of the group.
    fn append_scalars(&mut self, step: i64, scalars: &[(String, f64)]) -> Result<(), TrainingError> {
        let value = scalars
            .iter()
            .map(|(tag, value)| SummaryValue {
                tag: tag.clone(),
                simple_value: Some(*value as f32),
            })
            .collect();
        self.append(&Event {
            wall_time: wall_time(),
            step,
            file_version: None,
            summary: Some(Summary { value }),
        })
    }

    fn append(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut payload = BytesMut::with_capacity(event.encoded_len());
        event.encode(&mut payload).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let header = (payload.len() as u64).to_le_bytes();

        let out = &mut self.out;
        out.write_all(&header)?;
        out.write_all(&masked_crc32(&header).to_le_bytes())?;
        out.write_all(&payload)?;
        out.write_all(&masked_crc32(&payload).to_le_bytes())?;

        self.unflushed += 1;
        if self.unflushed >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.out.flush().map_err(|err| {
            TrainingError::runtime(format!(
                "failed to flush tensorboard file {}: {err}",
                self.path.display()
            ))
        })?;
        self.unflushed = 0;
        Ok(())
    }
}

impl Drop for EventFile {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    crc.rotate_right(15).wrapping_add(0xa282_ead8)
}

fn wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

fn hostname() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|key| std::env::var(key).ok())
        .unwrap_or_else(|| "localhost".to_string())
}

// Subset of tensorflow/core/util/event.proto.
#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<SummaryValue>,
}

#[derive(Clone, PartialEq, Message)]
struct SummaryValue {
    #[prost(string, tag = "1")]
    tag: String,
    #[prost(float, optional, tag = "2")]
    simple_value: Option<f32>,
}
