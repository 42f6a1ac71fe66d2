/// Deep-supervision loss over every refinement stage
use candle_core::{Result, Tensor};

use crate::config::LossMode;
use crate::models::StagePrediction;

/// Loss of one stage against the targets (all NCHW, same shape)
///
/// * `Org`: `sum((hm - hm_gt)^2) + sum((paf - paf_gt)^2)`
/// * `L2Mean`: `mean(l2(hm - hm_gt), l2(paf - paf_gt))` with `l2(x) = sum(x^2) / 2`
pub fn stage_loss(
    mode: LossMode,
    prediction: &StagePrediction,
    heatmap_gt: &Tensor,
    paf_gt: &Tensor,
) -> Result<Tensor> {
    let hm = prediction.heatmap.sub(heatmap_gt)?.sqr()?.sum_all()?;
    let paf = prediction.paf.sub(paf_gt)?.sqr()?.sum_all()?;
    match mode {
        LossMode::Org => hm.add(&paf),
        // mean of two half-sums == (hm + paf) / 4
        LossMode::L2Mean => hm.add(&paf)?.affine(0.25, 0.0),
    }
}

/// Total objective and per-stage terms
#[derive(Debug, Clone)]
pub struct ComposedLoss {
    /// Sum of stage losses divided by the batch size (scalar)
    pub total: Tensor,
    /// Unnormalized per-stage losses (scalars)
    pub stages: Vec<Tensor>,
}

/// Sum the stage losses and divide by the batch size
pub fn compose_loss(
    mode: LossMode,
    predictions: &[StagePrediction],
    heatmap_gt: &Tensor,
    paf_gt: &Tensor,
) -> Result<ComposedLoss> {
    if predictions.is_empty() {
        candle_core::bail!("compose_loss needs at least one stage prediction");
    }
    let batch_size = heatmap_gt.dim(0)?;

    let stages = predictions
        .iter()
        .map(|p| stage_loss(mode, p, heatmap_gt, paf_gt))
        .collect::<Result<Vec<_>>>()?;

    let total = Tensor::stack(&stages, 0)?
        .sum_all()?
        .affine(1.0 / batch_size as f64, 0.0)?;

    Ok(ComposedLoss { total, stages })
}
