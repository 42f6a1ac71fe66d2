/// Network modules: frozen backbone and trainable refinement stages
///
/// Both are pure forward functions over NCHW tensors. The training core only
/// depends on the two traits below, so either side can be swapped out.
use candle_core::{Result, Tensor};

pub mod cpm;
pub mod loader;
pub mod vgg;

pub use cpm::CpmStages;
pub use loader::load_backbone;
pub use vgg::Vgg19Backbone;

/// Prediction of one refinement stage, NCHW at supervision resolution
#[derive(Debug, Clone)]
pub struct StagePrediction {
    /// [B, Ch, h, w]
    pub heatmap: Tensor,
    /// [B, Cc, h, w]
    pub paf: Tensor,
}

/// Output of the refinement network
#[derive(Debug, Clone)]
pub struct RefinementOutputs {
    /// Shared features after the added layers: [B, 128, h, w]
    pub added: Tensor,
    /// One prediction per stage, in cascade order
    pub stages: Vec<StagePrediction>,
}

/// Frozen feature extractor
pub trait BackboneNet: Send {
    /// Normalized images [B, 3, H, W] -> features [B, C, H/stride, W/stride]
    fn forward(&self, images: &Tensor) -> Result<Tensor>;

    /// Channels of the feature map
    fn out_channels(&self) -> usize;

    /// Spatial downsampling factor
    fn stride(&self) -> usize;
}

/// Cascaded refinement stages
pub trait RefinementNet: Send {
    fn forward(&self, features: &Tensor) -> Result<RefinementOutputs>;

    fn stage_num(&self) -> usize;
}
