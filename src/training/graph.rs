/// Forward pipeline: normalization, frozen backbone, refinement cascade
///
/// `GraphBuilder` validates the wiring once and returns an immutable
/// `PoseGraph`; executing the graph has no side effects on its description.
use candle_core::{Device, Tensor};

use crate::config::SampleShape;
use crate::data::MiniBatch;
use crate::models::{BackboneNet, RefinementNet, StagePrediction};
use crate::PoseError;

/// Everything produced by one forward pass, NCHW
pub struct ForwardOutputs {
    /// Input rescaled to [-0.5, 0.5]: [B, 3, H, W]
    pub normalized: Tensor,
    /// Detached backbone features: [B, C, h, w]
    pub features: Tensor,
    /// Added-layer features: [B, 128, h, w]
    pub added: Tensor,
    /// One prediction per stage
    pub stages: Vec<StagePrediction>,
}

/// Supervision tensors permuted to NCHW
pub struct Targets {
    pub heatmap: Tensor,
    pub paf: Tensor,
}

pub struct GraphBuilder {
    shape: SampleShape,
    backbone: Option<Box<dyn BackboneNet>>,
    refinement: Option<Box<dyn RefinementNet>>,
}

impl GraphBuilder {
    pub fn new(shape: SampleShape) -> Self {
        Self {
            shape,
            backbone: None,
            refinement: None,
        }
    }

    pub fn backbone(mut self, backbone: Box<dyn BackboneNet>) -> Self {
        self.backbone = Some(backbone);
        self
    }

    pub fn refinement(mut self, refinement: Box<dyn RefinementNet>) -> Self {
        self.refinement = Some(refinement);
        self
    }

    /// Check the wiring and freeze it into a `PoseGraph`
    pub fn build(self) -> crate::Result<PoseGraph> {
        let backbone = self
            .backbone
            .ok_or_else(|| PoseError::Startup("graph has no backbone".to_string()))?;
        let refinement = self
            .refinement
            .ok_or_else(|| PoseError::Startup("graph has no refinement stages".to_string()))?;

        let stride = backbone.stride();
        if stride == 0
            || self.shape.input_height / stride != self.shape.output_height
            || self.shape.input_width / stride != self.shape.output_width
        {
            return Err(PoseError::Startup(format!(
                "backbone stride {} does not map {}x{} input to {}x{} supervision",
                stride,
                self.shape.input_height,
                self.shape.input_width,
                self.shape.output_height,
                self.shape.output_width
            )));
        }

        Ok(PoseGraph {
            shape: self.shape,
            backbone,
            refinement,
        })
    }
}

/// Immutable computation description
pub struct PoseGraph {
    shape: SampleShape,
    backbone: Box<dyn BackboneNet>,
    refinement: Box<dyn RefinementNet>,
}

impl PoseGraph {
    pub fn shape(&self) -> &SampleShape {
        &self.shape
    }

    pub fn stage_num(&self) -> usize {
        self.refinement.stage_num()
    }

    /// Run the network on a batch of raw [B, H, W, 3] images in [0, 255]
    pub fn forward(&self, images: &Tensor) -> candle_core::Result<ForwardOutputs> {
        let normalized = images
            .affine(1.0 / 255.0, -0.5)?
            .permute((0, 3, 1, 2))?
            .contiguous()?;
        let features = self.backbone.forward(&normalized)?.detach();
        let refined = self.refinement.forward(&features)?;

        Ok(ForwardOutputs {
            normalized,
            features,
            added: refined.added,
            stages: refined.stages,
        })
    }

    /// Batch targets as NCHW tensors on `device`
    pub fn targets(&self, batch: &MiniBatch, device: &Device) -> candle_core::Result<Targets> {
        Ok(Targets {
            heatmap: batch
                .heatmaps
                .to_device(device)?
                .permute((0, 3, 1, 2))?
                .contiguous()?,
            paf: batch
                .pafs
                .to_device(device)?
                .permute((0, 3, 1, 2))?
                .contiguous()?,
        })
    }
}
