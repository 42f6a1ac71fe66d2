//! End-to-end runs of the training loop on small synthetic inputs
use candle_core::{DType, Device, Tensor};
use cpm_pose_train::data::{Sample, SampleProducer, SyntheticProducer};
use cpm_pose_train::models::Vgg19Backbone;
use cpm_pose_train::training::{CheckpointStore, TrainerState};
use cpm_pose_train::{PoseError, Result, TrainConfig, Trainer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Backbone snapshot with every weight and bias at zero
fn write_zero_backbone(dir: &Path) -> Result<PathBuf> {
    let device = Device::Cpu;
    let mut tensors = HashMap::new();
    for (name, shape) in Vgg19Backbone::parameter_shapes() {
        tensors.insert(name, Tensor::zeros(shape, DType::F32, &device)?);
    }
    let path = dir.join("vgg_19.safetensors");
    candle_core::safetensors::save(&tensors, &path)?;
    Ok(path)
}

fn small_config(root: &Path) -> Result<TrainConfig> {
    Ok(TrainConfig {
        batch_size: 2,
        input_width: 32,
        input_height: 32,
        stage_num: 2,
        hm_channels: 19,
        cpm_channels: 38,
        backbone_net_ckpt_path: write_zero_backbone(root)?,
        checkpoint_path: root.join("run-"),
        not_continue_training: true,
        save_summary_frequency: 1,
        save_checkpoint_frequency: 2,
        max_echos: 2.0,
        queue_size: 2,
        num_workers: 1,
        ..Default::default()
    })
}

fn zeros(config: &TrainConfig, len: usize) -> Vec<Box<dyn SampleProducer>> {
    vec![Box::new(SyntheticProducer::zeros(config.sample_shape(), len))]
}

#[test]
fn test_zero_inputs_reach_zero_loss_and_stop_at_max_epochs() -> Result<()> {
    let root = tempfile::tempdir()?;
    let config = small_config(root.path())?;

    let mut trainer = Trainer::new(config.clone(), Device::Cpu, zeros(&config, 4))?;
    assert_eq!(trainer.state(), TrainerState::Init);
    assert_eq!(trainer.steps_per_epoch(), 2);

    let report = trainer.run()?;

    assert_eq!(trainer.state(), TrainerState::Terminated);
    assert_eq!(report.start_step, 0);
    assert_eq!(report.final_step, 4);
    assert_eq!(report.final_epoch, 2.0);
    assert_eq!(report.last_loss, Some(0.0));

    let run_dir = trainer.run_dir().to_path_buf();
    assert_eq!(
        report.checkpoints,
        vec![run_dir.join("model-2.safetensors"), run_dir.join("model-4.safetensors")]
    );
    assert!(run_dir.join("train_log.log").is_file());
    assert!(run_dir.join("train_config.json").is_file());

    let events = std::fs::read_to_string(run_dir.join("events.jsonl"))?;
    let scalars = events
        .lines()
        .filter(|l| l.contains("\"kind\":\"scalar\"") && l.contains("\"tag\":\"loss\""))
        .count();
    assert_eq!(scalars, 4);
    assert!(run_dir.join("images/hm_pre_stage_2-4.png").is_file());

    Ok(())
}

#[test]
fn test_fractional_max_epochs_stops_on_first_crossing() -> Result<()> {
    let root = tempfile::tempdir()?;
    let config = TrainConfig {
        max_echos: 1.5,
        save_summary_frequency: 100,
        ..small_config(root.path())?
    };

    let mut trainer = Trainer::new(config.clone(), Device::Cpu, zeros(&config, 4))?;
    let report = trainer.run()?;

    assert_eq!(report.final_step, 3);
    assert_eq!(report.final_epoch, 1.5);
    assert_eq!(report.checkpoints.len(), 1);

    Ok(())
}

#[test]
fn test_resume_continues_from_latest_checkpoint() -> Result<()> {
    let root = tempfile::tempdir()?;
    let first = TrainConfig {
        max_echos: 1.0,
        ..small_config(root.path())?
    };

    let run_dir = {
        let mut trainer = Trainer::new(first.clone(), Device::Cpu, zeros(&first, 4))?;
        let report = trainer.run()?;
        assert_eq!(report.final_step, 2);
        trainer.run_dir().to_path_buf()
    };

    let resumed = TrainConfig {
        checkpoint_path: run_dir.clone(),
        not_continue_training: false,
        max_echos: 2.0,
        ..first
    };
    let mut trainer = Trainer::new(resumed.clone(), Device::Cpu, zeros(&resumed, 4))?;
    assert_eq!(trainer.global_step(), 2);
    assert_eq!(trainer.run_dir(), run_dir.as_path());

    let report = trainer.run()?;
    assert_eq!(report.start_step, 2);
    assert_eq!(report.final_step, 4);
    assert_eq!(report.checkpoints, vec![run_dir.join("model-4.safetensors")]);

    let (latest, _) = CheckpointStore::new(&run_dir).latest()?.unwrap();
    assert_eq!(latest, 4);

    // learning rate stored for the next step follows the same schedule
    let (_, metadata) = CheckpointStore::load(run_dir.join("model-4.safetensors"), &Device::Cpu)?;
    assert_eq!(metadata.global_step, 4);
    assert_eq!(metadata.learning_rate, 1e-4 * 0.25);

    Ok(())
}

#[test]
fn test_missing_backbone_is_startup_error() -> Result<()> {
    let root = tempfile::tempdir()?;
    let config = TrainConfig {
        backbone_net_ckpt_path: root.path().join("absent.safetensors"),
        ..small_config(root.path())?
    };

    let result = Trainer::new(config.clone(), Device::Cpu, zeros(&config, 4));
    assert!(matches!(result, Err(PoseError::Startup(_))));

    Ok(())
}

#[test]
fn test_resume_without_checkpoint_is_resume_error() -> Result<()> {
    let root = tempfile::tempdir()?;
    let empty_run = root.path().join("empty-run");
    std::fs::create_dir(&empty_run)?;
    let config = TrainConfig {
        checkpoint_path: empty_run,
        not_continue_training: false,
        ..small_config(root.path())?
    };

    let result = Trainer::new(config.clone(), Device::Cpu, zeros(&config, 4));
    assert!(matches!(result, Err(PoseError::Resume(_))));

    Ok(())
}

#[test]
fn test_corrupt_checkpoint_is_resume_error() -> Result<()> {
    let root = tempfile::tempdir()?;
    let run = root.path().join("corrupt-run");
    std::fs::create_dir(&run)?;
    std::fs::write(run.join("model-9.safetensors"), b"not a checkpoint")?;
    let config = TrainConfig {
        checkpoint_path: run,
        not_continue_training: false,
        ..small_config(root.path())?
    };

    let result = Trainer::new(config.clone(), Device::Cpu, zeros(&config, 4));
    assert!(matches!(result, Err(PoseError::Resume(_))));

    Ok(())
}

#[test]
fn test_dataset_smaller_than_batch_is_config_error() -> Result<()> {
    let root = tempfile::tempdir()?;
    let config = small_config(root.path())?;

    let result = Trainer::new(config.clone(), Device::Cpu, zeros(&config, 1));
    assert!(matches!(result, Err(PoseError::Config(_))));

    Ok(())
}

/// Yields one good sample, then a fatal read error
struct Failing {
    inner: SyntheticProducer,
    served: usize,
}

impl SampleProducer for Failing {
    fn len(&self) -> usize {
        4
    }

    fn next_sample(&mut self) -> Option<Result<Sample>> {
        self.served += 1;
        if self.served > 1 {
            return Some(Err(PoseError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated annotation file",
            ))));
        }
        self.inner.next_sample()
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}

#[test]
fn test_worker_failure_aborts_run() -> Result<()> {
    let root = tempfile::tempdir()?;
    let config = small_config(root.path())?;
    let producer = Failing {
        inner: SyntheticProducer::zeros(config.sample_shape(), 4),
        served: 0,
    };

    let mut trainer = Trainer::new(config, Device::Cpu, vec![Box::new(producer)])?;
    let result = trainer.run();

    match result {
        Err(PoseError::Pipeline(message)) => assert!(message.contains("truncated annotation file")),
        other => panic!("expected pipeline failure, got {:?}", other.map(|r| r.final_step)),
    }
    assert_eq!(trainer.state(), TrainerState::Terminated);
    assert_eq!(trainer.global_step(), 0);

    Ok(())
}

#[test]
fn test_more_workers_than_samples_still_trains() -> Result<()> {
    let root = tempfile::tempdir()?;
    let config = TrainConfig {
        batch_size: 1,
        num_workers: 3,
        max_echos: 1.0,
        save_summary_frequency: 100,
        save_checkpoint_frequency: 100,
        ..small_config(root.path())?
    };
    let producers: Vec<Box<dyn SampleProducer>> =
        SyntheticProducer::sharded(config.sample_shape(), 2, config.num_workers)
            .into_iter()
            .map(|p| Box::new(p) as Box<dyn SampleProducer>)
            .collect();

    let mut trainer = Trainer::new(config, Device::Cpu, producers)?;
    let report = trainer.run()?;

    assert_eq!(report.final_step, 2);
    assert_eq!(trainer.state(), TrainerState::Terminated);

    Ok(())
}

#[test]
fn test_empty_shard_next_to_full_one_is_tolerated() -> Result<()> {
    let root = tempfile::tempdir()?;
    let config = TrainConfig {
        max_echos: 1.0,
        save_summary_frequency: 100,
        save_checkpoint_frequency: 100,
        ..small_config(root.path())?
    };
    let producers: Vec<Box<dyn SampleProducer>> = vec![
        Box::new(SyntheticProducer::zeros(config.sample_shape(), 4)),
        Box::new(SyntheticProducer::zeros(config.sample_shape(), 0)),
    ];

    let mut trainer = Trainer::new(config, Device::Cpu, producers)?;
    let report = trainer.run()?;
    assert_eq!(report.final_step, 2);

    Ok(())
}

#[test]
fn test_summary_write_failure_does_not_stop_training() -> Result<()> {
    let root = tempfile::tempdir()?;
    let config = small_config(root.path())?;

    let mut trainer = Trainer::new(config.clone(), Device::Cpu, zeros(&config, 4))?;
    let images = trainer.run_dir().join("images");
    std::fs::remove_dir_all(&images)?;
    std::fs::write(&images, b"not a directory")?;

    let report = trainer.run()?;

    assert_eq!(report.final_step, 4);
    assert_eq!(report.checkpoints.len(), 2);
    assert_eq!(trainer.state(), TrainerState::Terminated);
    assert!(images.is_file());

    Ok(())
}

#[test]
fn test_checkpoint_write_failure_aborts_run() -> Result<()> {
    let root = tempfile::tempdir()?;
    let config = TrainConfig {
        save_summary_frequency: 100,
        ..small_config(root.path())?
    };

    let mut trainer = Trainer::new(config.clone(), Device::Cpu, zeros(&config, 4))?;
    let blocker = trainer.run_dir().join("model-2.safetensors");
    std::fs::write(&blocker, b"occupied")?;

    let result = trainer.run();

    assert!(matches!(result, Err(PoseError::CheckpointWrite(_))));
    assert_eq!(trainer.state(), TrainerState::Terminated);
    assert_eq!(trainer.global_step(), 2);
    assert_eq!(std::fs::read(&blocker)?, b"occupied");

    Ok(())
}
