pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod evaluation;
pub mod labels;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod overrides;
pub mod scheduler;
pub mod session;
pub mod trainer;

pub use config::{DeviceSpec, TrainingConfig};
pub use data::{BlockingDataLoader, DataLoader, SessionBatch, SessionDataLoader, SessionDataset};
pub use error::TrainingError;
pub use evaluation::{evaluate, EvaluationOutcome};
pub use labels::{Emotion, LabelSet, SessionSpec};
pub use loss::{CrossEntropyLoss, LossMetrics, LossOutput};
pub use optimizer::{AdamWConfig, StepStats, TrainerOptimizer, TrainerOptimizerOptions};
pub use scheduler::{LRScheduler, SchedulerConfig, StepBudget};
pub use session::{run_sessions, RunSummary};
pub use trainer::{SessionRun, SessionTrainer};
