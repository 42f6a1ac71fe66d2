/// Train the CPM pose network on COCO keypoints (or synthetic samples)
use std::path::PathBuf;

use clap::Parser;
use cpm_pose_train::data::{CocoPoseProducer, SampleProducer, SyntheticProducer};
use cpm_pose_train::utils::select_device;
use cpm_pose_train::{LossMode, TrainConfig, Trainer};

#[derive(Parser, Debug)]
#[command(name = "train", about = "CPM pose network training")]
struct TrainArgs {
    /// JSON configuration file; options below override it.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Samples per mini-batch.
    #[arg(long)]
    batch_size: Option<usize>,
    /// Network input width in pixels.
    #[arg(long)]
    input_width: Option<usize>,
    /// Network input height in pixels.
    #[arg(long)]
    input_height: Option<usize>,
    /// Number of refinement stages.
    #[arg(long)]
    stage_num: Option<usize>,
    /// Heatmap channels.
    #[arg(long)]
    hm_channels: Option<usize>,
    /// Part-affinity channels.
    #[arg(long)]
    cpm_channels: Option<usize>,
    /// Pretrained backbone snapshot (safetensors).
    #[arg(long)]
    backbone_net_ckpt_path: Option<PathBuf>,
    /// Run directory prefix (fresh) or run directory (resume).
    #[arg(long)]
    checkpoint_path: Option<PathBuf>,
    /// true: start a fresh timestamped run; false: resume the run in
    /// --checkpoint-path.
    #[arg(long)]
    not_continue_training: Option<bool>,
    /// Summary cadence in steps.
    #[arg(long)]
    save_summary_frequency: Option<usize>,
    /// Checkpoint cadence in steps.
    #[arg(long)]
    save_checkpoint_frequency: Option<usize>,
    /// Stop once this many epochs have run.
    #[arg(long)]
    max_echos: Option<f64>,
    /// COCO keypoint annotation file.
    #[arg(long)]
    annot_path_train: Option<PathBuf>,
    /// Training image directory.
    #[arg(long)]
    img_path_train: Option<PathBuf>,
    /// Loss scoring: org or l2.
    #[arg(long)]
    loss_func: Option<LossMode>,
    /// Prefetch queue capacity, in batches.
    #[arg(long)]
    queue_size: Option<usize>,
    /// Prefetch worker threads.
    #[arg(long)]
    num_workers: Option<usize>,
    /// Train on N constant synthetic samples instead of COCO.
    #[arg(long)]
    synthetic: Option<usize>,
}

impl TrainArgs {
    fn into_config(self) -> anyhow::Result<(TrainConfig, Option<usize>)> {
        let mut config = match &self.config {
            Some(path) => TrainConfig::from_json_file(path)?,
            None => TrainConfig::default(),
        };

        macro_rules! apply {
            ($($field:ident),*) => {
                $(if let Some(v) = self.$field { config.$field = v; })*
            };
        }
        apply!(
            batch_size,
            input_width,
            input_height,
            stage_num,
            hm_channels,
            cpm_channels,
            backbone_net_ckpt_path,
            checkpoint_path,
            not_continue_training,
            save_summary_frequency,
            save_checkpoint_frequency,
            max_echos,
            annot_path_train,
            img_path_train,
            loss_func,
            queue_size,
            num_workers
        );

        config.validate()?;
        Ok((config, self.synthetic))
    }
}

fn producers(config: &TrainConfig, synthetic: Option<usize>) -> anyhow::Result<Vec<Box<dyn SampleProducer>>> {
    let shape = config.sample_shape();
    let boxed: Vec<Box<dyn SampleProducer>> = match synthetic {
        Some(n) => SyntheticProducer::sharded(shape, n, config.num_workers)
            .into_iter()
            .map(|p| Box::new(p) as Box<dyn SampleProducer>)
            .collect(),
        None => {
            log::info!("Loading annotations from {:?}", config.annot_path_train);
            CocoPoseProducer::from_annotations(
                &config.annot_path_train,
                &config.img_path_train,
                shape,
                config.stride,
            )?
            .split(config.num_workers)
            .into_iter()
            .map(|p| Box::new(p) as Box<dyn SampleProducer>)
            .collect()
        }
    };
    Ok(boxed)
}

fn main() -> anyhow::Result<()> {
    let args = TrainArgs::parse();
    let (config, synthetic) = args.into_config()?;

    let device = select_device()?;

    let result = producers(&config, synthetic).and_then(|producers| {
        let mut trainer = Trainer::new(config, device, producers)?;
        log::info!("Run directory: {:?}", trainer.run_dir());
        Ok(trainer.run()?)
    });

    match result {
        Ok(report) => {
            log::info!(
                "Finished at step {} (epoch {:.3}), {} checkpoints written",
                report.final_step,
                report.final_epoch,
                report.checkpoints.len()
            );
            Ok(())
        }
        Err(e) => {
            log::error!("Fatal: {:#}", e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> TrainArgs {
        let argv = std::iter::once("train").chain(extra.iter().copied());
        TrainArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_overrides_apply_over_defaults() -> anyhow::Result<()> {
        let (config, synthetic) = args(&["--batch-size", "2", "--loss-func", "l2", "--synthetic", "8"])
            .into_config()?;
        assert_eq!(config.batch_size, 2);
        assert_eq!(config.loss_func, LossMode::L2Mean);
        assert!(config.not_continue_training);
        assert_eq!(synthetic, Some(8));
        Ok(())
    }

    #[test]
    fn test_continue_flag_overrides_config_file_both_ways() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let resume = dir.path().join("resume.json");
        std::fs::write(&resume, r#"{"not_continue_training": false}"#)?;
        let resume_arg = resume.to_string_lossy().to_string();

        let (config, _) = args(&["--config", &resume_arg]).into_config()?;
        assert!(!config.not_continue_training);

        let (config, _) = args(&["--config", &resume_arg, "--not-continue-training", "true"]).into_config()?;
        assert!(config.not_continue_training);

        let (config, _) = args(&["--not-continue-training", "false"]).into_config()?;
        assert!(!config.not_continue_training);
        Ok(())
    }
}
