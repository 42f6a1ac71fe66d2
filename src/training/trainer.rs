/// Training loop for the CPM pose network
use candle_core::Device;
use std::path::{Path, PathBuf};

use super::checkpoint::{CheckpointMetadata, CheckpointStore};
use super::context::TrainingContext;
use super::graph::{ForwardOutputs, GraphBuilder, PoseGraph, Targets};
use super::loss::compose_loss;
use super::optimizer::OptimizerDriver;
use super::params::ParameterPartition;
use super::scheduler::{ExponentialDecay, ExponentialDecayConfig};
use crate::config::TrainConfig;
use crate::data::{MiniBatch, PrefetchQueue, SampleProducer};
use crate::models::{load_backbone, BackboneNet, CpmStages};
use crate::PoseError;

/// Lifecycle of a trainer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Init,
    Running,
    Stopping,
    Terminated,
}

/// Summary of a finished run
#[derive(Debug, Clone)]
pub struct TrainingReport {
    /// Global step at startup (non-zero when resumed)
    pub start_step: usize,
    pub final_step: usize,
    pub final_epoch: f64,
    /// Total loss of the last step, if any step ran
    pub last_loss: Option<f64>,
    /// Checkpoint files written by this run
    pub checkpoints: Vec<PathBuf>,
}

/// Trainer for the CPM pose network
pub struct Trainer {
    config: TrainConfig,
    device: Device,
    context: TrainingContext,
    params: ParameterPartition,
    graph: PoseGraph,
    optimizer: OptimizerDriver,
    checkpoints: CheckpointStore,
    queue: Option<PrefetchQueue>,
    steps_per_epoch: usize,
    start_step: usize,
    state: TrainerState,
}

impl Trainer {
    /// Build everything the loop needs
    ///
    /// Creates or reuses the run directory, restores the backbone, builds the
    /// graph, restores the latest checkpoint when resuming and starts the
    /// prefetch workers. Any failure here aborts before the first step.
    pub fn new(
        config: TrainConfig,
        device: Device,
        producers: Vec<Box<dyn SampleProducer>>,
    ) -> crate::Result<Self> {
        config.validate()?;

        let total_samples: usize = producers.iter().map(|p| p.len()).sum();
        let steps_per_epoch = total_samples / config.batch_size;
        if steps_per_epoch == 0 {
            return Err(PoseError::Config(format!(
                "dataset of {} samples is smaller than one batch of {}",
                total_samples, config.batch_size
            )));
        }

        let context = TrainingContext::init(&config)?;

        let (backbone_tensors, backbone) = load_backbone(&config.backbone_net_ckpt_path, &device)?;
        let params = ParameterPartition::new(backbone_tensors);
        let refinement = CpmStages::new(
            backbone.out_channels(),
            config.stage_num,
            config.hm_channels,
            config.cpm_channels,
            params.refinement_builder(&device),
        )?;
        let graph = GraphBuilder::new(config.sample_shape())
            .backbone(Box::new(backbone))
            .refinement(Box::new(refinement))
            .build()?;

        let checkpoints = CheckpointStore::new(context.run_dir());
        let start_step = if context.is_fresh() {
            0
        } else {
            Self::restore_latest(&checkpoints, &params, &device)?
        };

        let scheduler = ExponentialDecay::new(ExponentialDecayConfig {
            base_lr: config.base_lr,
            decay_rate: config.decay_rate,
            decay_steps: steps_per_epoch,
        });
        let optimizer = OptimizerDriver::new(params.trainable_vars(), scheduler, start_step)?;

        let (frozen, trainable) = params.counts();
        log::info!(
            "Parameters: {:.2}M frozen backbone, {:.2}M trainable",
            frozen as f64 / 1_000_000.0,
            trainable as f64 / 1_000_000.0
        );
        log::info!(
            "{} samples, {} steps per epoch, starting at step {}",
            total_samples,
            steps_per_epoch,
            start_step
        );

        let queue = PrefetchQueue::start(
            producers,
            config.sample_shape(),
            config.batch_size,
            config.queue_size,
            context.cancel_token(),
        )?;

        Ok(Self {
            config,
            device,
            context,
            params,
            graph,
            optimizer,
            checkpoints,
            queue: Some(queue),
            steps_per_epoch,
            start_step,
            state: TrainerState::Init,
        })
    }

    fn restore_latest(
        store: &CheckpointStore,
        params: &ParameterPartition,
        device: &Device,
    ) -> crate::Result<usize> {
        let latest = store
            .latest()
            .map_err(|e| PoseError::Resume(format!("cannot list {:?}: {}", store.dir(), e)))?;
        let Some((step, path)) = latest else {
            return Err(PoseError::Resume(format!(
                "no checkpoint found in {:?}",
                store.dir()
            )));
        };

        let metadata = CheckpointStore::restore(&path, params.refinement(), device)?;
        if metadata.global_step != step {
            return Err(PoseError::Resume(format!(
                "{:?} records step {}",
                path, metadata.global_step
            )));
        }
        Ok(step)
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn global_step(&self) -> usize {
        self.optimizer.global_step()
    }

    pub fn steps_per_epoch(&self) -> usize {
        self.steps_per_epoch
    }

    /// step / steps_per_epoch
    pub fn epoch(&self) -> f64 {
        self.global_step() as f64 / self.steps_per_epoch as f64
    }

    pub fn run_dir(&self) -> &Path {
        self.context.run_dir()
    }

    /// Run until epoch >= max_echos, then stop the workers
    ///
    /// Fatal errors (pipeline failure, checkpoint write failure, numeric
    /// errors) abort the loop; the workers are stopped either way.
    pub fn run(&mut self) -> crate::Result<TrainingReport> {
        if self.state != TrainerState::Init {
            return Err(PoseError::Pipeline(format!(
                "trainer cannot run from state {:?}",
                self.state
            )));
        }

        self.state = TrainerState::Running;
        let result = self.run_loop();
        if let Err(e) = &result {
            log::error!("Training aborted at step {}: {}", self.global_step(), e);
        }

        self.state = TrainerState::Stopping;
        self.stop();
        self.state = TrainerState::Terminated;

        result
    }

    fn run_loop(&mut self) -> crate::Result<TrainingReport> {
        let mut report = TrainingReport {
            start_step: self.start_step,
            final_step: self.start_step,
            final_epoch: self.epoch(),
            last_loss: None,
            checkpoints: Vec::new(),
        };

        if report.final_epoch >= self.config.max_echos {
            log::info!(
                "Epoch {:.3} already reaches max_echos {}; nothing to do",
                report.final_epoch,
                self.config.max_echos
            );
            return Ok(report);
        }

        log::info!("Starting training until epoch {}", self.config.max_echos);

        loop {
            let batch = match self.queue.as_ref() {
                Some(queue) => queue.dequeue()?,
                None => return Err(PoseError::Pipeline("prefetch queue stopped".to_string())),
            };
            let batch = batch.to_device(&self.device)?;

            let outputs = self.graph.forward(&batch.images)?;
            let targets = self.graph.targets(&batch, &self.device)?;
            let loss = compose_loss(self.config.loss_func, &outputs.stages, &targets.heatmap, &targets.paf)?;
            let loss_value = loss.total.to_scalar::<f32>()? as f64;

            let outcome = self.optimizer.step(&loss.total)?;
            let step = outcome.step;
            let epoch = step as f64 / self.steps_per_epoch as f64;
            log::trace!("step {} loss {:.6} lr {:e}", step, loss_value, outcome.lr);

            report.final_step = step;
            report.final_epoch = epoch;
            report.last_loss = Some(loss_value);

            if step % self.config.save_summary_frequency == 0 {
                self.emit_summaries(&batch, step, epoch)?;
            }

            if step % self.config.save_checkpoint_frequency == 0 {
                let path = self.save_checkpoint(step, Some(loss_value))?;
                report.checkpoints.push(path);
            }

            if epoch >= self.config.max_echos {
                break;
            }
        }

        log::info!(
            "Training complete: step {}, epoch {:.3}",
            report.final_step,
            report.final_epoch
        );
        Ok(report)
    }

    /// Recompute the batch loss with the updated parameters, log the
    /// progress line and write summaries (best effort)
    fn emit_summaries(&mut self, batch: &MiniBatch, step: usize, epoch: f64) -> crate::Result<()> {
        let outputs = self.graph.forward(&batch.images)?;
        let targets = self.graph.targets(batch, &self.device)?;
        let loss = compose_loss(self.config.loss_func, &outputs.stages, &targets.heatmap, &targets.paf)?;
        let total = loss.total.to_scalar::<f32>()? as f64;
        let lr = self.optimizer.current_lr();

        log::info!(
            "epochs={:.6}, step={}, total_loss={:.6}, lr={:e}",
            epoch,
            step,
            total,
            lr
        );

        let stage_losses = loss
            .stages
            .iter()
            .map(|t| t.to_scalar::<f32>().map(|v| v as f64))
            .collect::<candle_core::Result<Vec<_>>>()?;

        if let Some(writer) = self.context.summary() {
            if let Err(e) = write_summaries(writer, step, lr, total, &stage_losses, &outputs, &targets) {
                log::warn!("Summary write failed at step {}: {}", step, e);
            }
        }
        Ok(())
    }

    /// Persist the refinement partition; any failure is fatal
    fn save_checkpoint(&self, step: usize, loss: Option<f64>) -> crate::Result<PathBuf> {
        let metadata = CheckpointMetadata {
            global_step: step,
            learning_rate: self.optimizer.current_lr(),
            loss,
        };
        let tensors = self
            .params
            .refinement_tensors()
            .map_err(|e| PoseError::CheckpointWrite(e.to_string()))?;
        self.checkpoints.save(&tensors, &metadata)
    }

    /// Stop and join the workers, then close the run context
    fn stop(&mut self) {
        if let Some(mut queue) = self.queue.take() {
            log::debug!("Stopping prefetch workers ({} batches buffered)", queue.buffered());
            queue.shutdown();
        }
        self.context.shutdown();
    }
}

impl Drop for Trainer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Scalars, histograms and first-sample image mosaics of one step
fn write_summaries(
    writer: &mut super::telemetry::SummaryWriter,
    step: usize,
    lr: f64,
    total: f64,
    stage_losses: &[f64],
    outputs: &ForwardOutputs,
    targets: &Targets,
) -> crate::Result<()> {
    writer.add_scalar("lr", lr, step)?;
    writer.add_scalar("loss", total, step)?;
    for (i, value) in stage_losses.iter().enumerate() {
        writer.add_scalar(&format!("loss_stage_{}", i + 1), *value, step)?;
    }

    if let Some(last) = outputs.stages.last() {
        writer.add_histogram("hm_pre", &last.heatmap, step)?;
    }
    writer.add_histogram("img_normalized", &outputs.normalized, step)?;
    writer.add_histogram("vgg_outputs", &outputs.features, step)?;
    writer.add_histogram("added_layers_out", &outputs.added, step)?;

    writer.add_channel_mosaic("vgg_out", &outputs.features.get(0)?, 512, step)?;
    writer.add_channel_mosaic("added_layers_out", &outputs.added.get(0)?, 128, step)?;
    writer.add_channel_mosaic("cpm_gt", &targets.paf.get(0)?, 38, step)?;
    writer.add_channel_mosaic("hm_gt", &targets.heatmap.get(0)?, 19, step)?;
    for (i, stage) in outputs.stages.iter().enumerate() {
        writer.add_channel_mosaic(&format!("hm_pre_stage_{}", i + 1), &stage.heatmap.get(0)?, 19, step)?;
        writer.add_channel_mosaic(&format!("cpm_pre_stage_{}", i + 1), &stage.paf.get(0)?, 38, step)?;
    }
    writer.add_rgb_image("input", &outputs.normalized.get(0)?, step)?;

    writer.flush()
}
