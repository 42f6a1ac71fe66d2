/// Multi-stage CPM refinement network
///
/// Added layers squeeze the backbone map to 128 channels. Stage 1 runs two
/// branches (PAF and heatmap) on those features; every later stage consumes
/// the features concatenated with the previous stage's predictions.
use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use super::{RefinementNet, RefinementOutputs, StagePrediction};
use crate::layers::conv::{forward_all, ConvBlock};

/// Width of the shared feature map and of the stage branches
pub const FEATURE_CHANNELS: usize = 128;

/// One prediction branch: hidden convolutions + linear 1x1 head
struct Branch {
    blocks: Vec<ConvBlock>,
}

impl Branch {
    /// Stage-1 branch: 3x 3x3x128, 1x1x512, 1x1xC
    fn first(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let blocks = vec![
            ConvBlock::new(in_channels, 128, 3, true, vb.pp("conv1"))?,
            ConvBlock::new(128, 128, 3, true, vb.pp("conv2"))?,
            ConvBlock::new(128, 128, 3, true, vb.pp("conv3"))?,
            ConvBlock::new(128, 512, 1, true, vb.pp("conv4"))?,
            ConvBlock::new(512, out_channels, 1, false, vb.pp("conv5"))?,
        ];
        Ok(Self { blocks })
    }

    /// Later-stage branch: 5x 7x7x128, 1x1x128, 1x1xC
    fn refine(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let mut blocks = Vec::with_capacity(7);
        blocks.push(ConvBlock::new(in_channels, 128, 7, true, vb.pp("conv1"))?);
        for i in 2..=5 {
            blocks.push(ConvBlock::new(128, 128, 7, true, vb.pp(format!("conv{}", i)))?);
        }
        blocks.push(ConvBlock::new(128, 128, 1, true, vb.pp("conv6"))?);
        blocks.push(ConvBlock::new(128, out_channels, 1, false, vb.pp("conv7"))?);
        Ok(Self { blocks })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        forward_all(&self.blocks, xs)
    }
}

struct Stage {
    paf: Branch,
    heatmap: Branch,
}

pub struct CpmStages {
    added: Vec<ConvBlock>,
    stages: Vec<Stage>,
}

impl CpmStages {
    /// Create the refinement network
    ///
    /// # Arguments
    /// * `in_channels` - Backbone feature channels
    /// * `stage_num` - Number of stages (>= 1)
    /// * `hm_channels` - Heatmap channels per prediction
    /// * `cpm_channels` - PAF channels per prediction
    /// * `vb` - VarBuilder for the trainable partition
    pub fn new(
        in_channels: usize,
        stage_num: usize,
        hm_channels: usize,
        cpm_channels: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if stage_num == 0 {
            candle_core::bail!("CpmStages needs at least one stage");
        }

        let added = vec![
            ConvBlock::new(in_channels, 256, 3, true, vb.pp("added").pp("conv4_3_cpm"))?,
            ConvBlock::new(256, FEATURE_CHANNELS, 3, true, vb.pp("added").pp("conv4_4_cpm"))?,
        ];

        let mut stages = Vec::with_capacity(stage_num);
        stages.push(Stage {
            paf: Branch::first(FEATURE_CHANNELS, cpm_channels, vb.pp("stage1").pp("paf"))?,
            heatmap: Branch::first(FEATURE_CHANNELS, hm_channels, vb.pp("stage1").pp("heatmap"))?,
        });

        let refine_in = FEATURE_CHANNELS + cpm_channels + hm_channels;
        for s in 2..=stage_num {
            let svb = vb.pp(format!("stage{}", s));
            stages.push(Stage {
                paf: Branch::refine(refine_in, cpm_channels, svb.pp("paf"))?,
                heatmap: Branch::refine(refine_in, hm_channels, svb.pp("heatmap"))?,
            });
        }

        Ok(Self { added, stages })
    }
}

impl RefinementNet for CpmStages {
    fn forward(&self, features: &Tensor) -> Result<RefinementOutputs> {
        let added = forward_all(&self.added, features)?;

        let mut predictions: Vec<StagePrediction> = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let input = match predictions.last() {
                None => added.clone(),
                Some(prev) => Tensor::cat(&[&added, &prev.paf, &prev.heatmap], 1)?,
            };
            predictions.push(StagePrediction {
                paf: stage.paf.forward(&input)?,
                heatmap: stage.heatmap.forward(&input)?,
            });
        }

        Ok(RefinementOutputs {
            added,
            stages: predictions,
        })
    }

    fn stage_num(&self) -> usize {
        self.stages.len()
    }
}
