/// Training infrastructure: graph, loss, optimizer, checkpoints, telemetry
pub mod checkpoint;
pub mod context;
pub mod graph;
pub mod loss;
pub mod optimizer;
pub mod params;
pub mod scheduler;
pub mod telemetry;
pub mod trainer;

pub use checkpoint::{CheckpointMetadata, CheckpointStore};
pub use context::TrainingContext;
pub use graph::{GraphBuilder, PoseGraph};
pub use loss::{compose_loss, stage_loss, ComposedLoss};
pub use optimizer::{OptimizerDriver, StepOutcome};
pub use params::ParameterPartition;
pub use scheduler::{ExponentialDecay, ExponentialDecayConfig};
pub use telemetry::SummaryWriter;
pub use trainer::{Trainer, TrainerState, TrainingReport};
