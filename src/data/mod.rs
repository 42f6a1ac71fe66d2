/// Data feeding for pose training
pub mod coco;
pub mod prefetch;
pub mod queue;
pub mod synthetic;

pub use coco::CocoPoseProducer;
pub use prefetch::PrefetchQueue;
pub use queue::{bounded_queue, BatchReceiver, BatchSender, CancelToken, QueueError};
pub use synthetic::SyntheticProducer;

use candle_core::{Device, Result, Tensor};

use crate::config::SampleShape;

/// One augmented training sample, channels-last
#[derive(Debug, Clone)]
pub struct Sample {
    /// Raw pixels in [0, 255]: [H, W, 3]
    pub image: Tensor,
    /// Keypoint heatmaps: [h, w, Ch]
    pub heatmap: Tensor,
    /// Part-affinity fields: [h, w, Cc]
    pub paf: Tensor,
}

impl Sample {
    /// Check tensor dims against the configured geometry
    pub fn check_shape(&self, shape: &SampleShape) -> crate::Result<()> {
        let checks = [
            ("image", self.image.dims(), shape.image_dims()),
            ("heatmap", self.heatmap.dims(), shape.heatmap_dims()),
            ("paf", self.paf.dims(), shape.paf_dims()),
        ];
        for (name, actual, expected) in checks {
            if actual != expected.as_slice() {
                return Err(crate::PoseError::Sample(format!(
                    "{} has shape {:?}, expected {:?}",
                    name, actual, expected
                )));
            }
        }
        Ok(())
    }
}

/// A stacked mini-batch; all three tensors share the leading dim `B`
#[derive(Debug, Clone)]
pub struct MiniBatch {
    /// [B, H, W, 3]
    pub images: Tensor,
    /// [B, h, w, Ch]
    pub heatmaps: Tensor,
    /// [B, h, w, Cc]
    pub pafs: Tensor,
}

impl MiniBatch {
    /// Stack samples along a new leading batch dimension
    pub fn stack(samples: &[Sample]) -> Result<Self> {
        let images: Vec<&Tensor> = samples.iter().map(|s| &s.image).collect();
        let heatmaps: Vec<&Tensor> = samples.iter().map(|s| &s.heatmap).collect();
        let pafs: Vec<&Tensor> = samples.iter().map(|s| &s.paf).collect();
        Ok(Self {
            images: Tensor::stack(&images, 0)?,
            heatmaps: Tensor::stack(&heatmaps, 0)?,
            pafs: Tensor::stack(&pafs, 0)?,
        })
    }

    pub fn batch_size(&self) -> Result<usize> {
        self.images.dim(0)
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            images: self.images.to_device(device)?,
            heatmaps: self.heatmaps.to_device(device)?,
            pafs: self.pafs.to_device(device)?,
        })
    }
}

/// Source of augmented samples
///
/// A producer walks one pass over its share of the dataset; `None` marks the
/// end of the pass and `reset` starts the next one.
pub trait SampleProducer: Send {
    /// Number of samples in one pass
    fn len(&self) -> usize;

    /// Next sample of the current pass. `Err(PoseError::Sample)` marks a
    /// skippable sample, any other error is fatal to the worker.
    fn next_sample(&mut self) -> Option<crate::Result<Sample>>;

    /// Restart for a new pass
    fn reset(&mut self);

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
