/// Configuration for a pose training run
///
/// Mirrors the option surface of the training script: input geometry,
/// channel layout, paths, cadences and the stopping criterion.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Per-stage loss scoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossMode {
    /// Sum of squared errors over heatmap and PAF, unnormalized per element.
    #[default]
    #[serde(rename = "org")]
    Org,
    /// Mean of the two half-sum-of-squares (l2) terms.
    #[serde(rename = "l2")]
    L2Mean,
}

impl std::str::FromStr for LossMode {
    type Err = crate::PoseError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "org" => Ok(LossMode::Org),
            "l2" | "l2_mean" => Ok(LossMode::L2Mean),
            other => Err(crate::PoseError::Config(format!(
                "Invalid loss_func: {}. Must be 'org' or 'l2'",
                other
            ))),
        }
    }
}

/// Tensor geometry of a single training sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleShape {
    pub input_height: usize,
    pub input_width: usize,
    /// Supervision resolution (input / stride)
    pub output_height: usize,
    pub output_width: usize,
    pub hm_channels: usize,
    pub cpm_channels: usize,
}

impl SampleShape {
    pub fn image_dims(&self) -> [usize; 3] {
        [self.input_height, self.input_width, 3]
    }

    pub fn heatmap_dims(&self) -> [usize; 3] {
        [self.output_height, self.output_width, self.hm_channels]
    }

    pub fn paf_dims(&self) -> [usize; 3] {
        [self.output_height, self.output_width, self.cpm_channels]
    }
}

/// Training run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Samples per mini-batch
    pub batch_size: usize,

    /// Network input width in pixels
    pub input_width: usize,

    /// Network input height in pixels
    pub input_height: usize,

    /// Number of refinement stages
    pub stage_num: usize,

    /// Heatmap channels (keypoints + background)
    pub hm_channels: usize,

    /// Part-affinity channels (2 per limb)
    pub cpm_channels: usize,

    /// Pretrained backbone snapshot (safetensors)
    pub backbone_net_ckpt_path: PathBuf,

    /// Prefix for fresh run directories, or the run directory to resume
    pub checkpoint_path: PathBuf,

    /// Start a fresh run instead of resuming `checkpoint_path`
    pub not_continue_training: bool,

    /// Emit summaries every N steps
    pub save_summary_frequency: usize,

    /// Write a checkpoint every N steps
    pub save_checkpoint_frequency: usize,

    /// Stop once epoch >= max_echos
    pub max_echos: f64,

    /// COCO keypoint annotation file
    pub annot_path_train: PathBuf,

    /// Directory holding the training images
    pub img_path_train: PathBuf,

    /// Per-stage loss scoring
    pub loss_func: LossMode,

    /// Prefetch queue capacity, in batches
    pub queue_size: usize,

    /// Number of prefetch worker threads
    pub num_workers: usize,

    /// Learning rate at step 0
    pub base_lr: f64,

    /// Multiplicative decay applied once per epoch
    pub decay_rate: f64,

    /// Backbone downsampling factor
    pub stride: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            input_width: 368,
            input_height: 368,
            stage_num: 6,
            hm_channels: 19,
            cpm_channels: 38,
            backbone_net_ckpt_path: PathBuf::from("checkpoints/vgg/vgg_19.safetensors"),
            checkpoint_path: PathBuf::from("checkpoints/train/"),
            not_continue_training: true,
            save_summary_frequency: 100,
            save_checkpoint_frequency: 1000,
            max_echos: 5.0,
            annot_path_train: PathBuf::from("COCO/annotations/person_keypoints_train2017.json"),
            img_path_train: PathBuf::from("COCO/images/train2017/"),
            loss_func: LossMode::Org,
            queue_size: 4,
            num_workers: 1,
            base_lr: 1e-4,
            decay_rate: 0.5,
            stride: 8,
        }
    }
}

impl TrainConfig {
    /// Load configuration from a JSON file; missing fields take defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.batch_size == 0 {
            return Err(crate::PoseError::Config("batch_size must be > 0".to_string()));
        }

        if self.stage_num == 0 {
            return Err(crate::PoseError::Config("stage_num must be > 0".to_string()));
        }

        if self.hm_channels == 0 || self.cpm_channels == 0 {
            return Err(crate::PoseError::Config(
                "hm_channels and cpm_channels must be > 0".to_string(),
            ));
        }

        if self.stride == 0
            || self.input_width == 0
            || self.input_height == 0
            || self.input_width % self.stride != 0
            || self.input_height % self.stride != 0
        {
            return Err(crate::PoseError::Config(format!(
                "input size {}x{} must be a positive multiple of stride {}",
                self.input_width, self.input_height, self.stride
            )));
        }

        if self.save_summary_frequency == 0 || self.save_checkpoint_frequency == 0 {
            return Err(crate::PoseError::Config(
                "save_summary_frequency and save_checkpoint_frequency must be > 0".to_string(),
            ));
        }

        if !self.max_echos.is_finite() || self.max_echos < 0.0 {
            return Err(crate::PoseError::Config(format!(
                "max_echos must be a finite value >= 0, got {}",
                self.max_echos
            )));
        }

        if self.queue_size == 0 || self.num_workers == 0 {
            return Err(crate::PoseError::Config(
                "queue_size and num_workers must be > 0".to_string(),
            ));
        }

        if !(self.base_lr > 0.0) || !(self.decay_rate > 0.0) {
            return Err(crate::PoseError::Config(
                "base_lr and decay_rate must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Supervision resolution (height, width)
    pub fn output_size(&self) -> (usize, usize) {
        (self.input_height / self.stride, self.input_width / self.stride)
    }

    /// Geometry of one sample under this configuration
    pub fn sample_shape(&self) -> SampleShape {
        let (output_height, output_width) = self.output_size();
        SampleShape {
            input_height: self.input_height,
            input_width: self.input_width,
            output_height,
            output_width,
            hm_channels: self.hm_channels,
            cpm_channels: self.cpm_channels,
        }
    }
}
