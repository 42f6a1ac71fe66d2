/// Convolution block used by both the backbone and the refinement stages
use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Init, VarBuilder};

/// Weight init for freshly created stage parameters
const WEIGHT_INIT: Init = Init::Randn {
    mean: 0.0,
    stdev: 0.01,
};

/// Square "same"-padded convolution with optional ReLU
pub struct ConvBlock {
    conv: Conv2d,
    relu: bool,
}

impl ConvBlock {
    /// Create new ConvBlock
    ///
    /// # Arguments
    /// * `in_channels` - Input channels
    /// * `out_channels` - Output channels
    /// * `kernel` - Kernel size (odd)
    /// * `relu` - Apply ReLU after the convolution
    /// * `vb` - VarBuilder holding `weight` and `bias`
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        relu: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.get_with_hints(
            (out_channels, in_channels, kernel, kernel),
            "weight",
            WEIGHT_INIT,
        )?;
        // Zero bias: an all-zero input maps to an all-zero output
        let bias = vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?;

        let config = Conv2dConfig {
            padding: kernel / 2,
            ..Default::default()
        };

        Ok(Self {
            conv: Conv2d::new(weight, Some(bias), config),
            relu,
        })
    }

    /// Expected (name, shape) pairs under this block's prefix
    pub fn parameter_shapes(
        prefix: &str,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
    ) -> Vec<(String, Vec<usize>)> {
        vec![
            (
                format!("{}.weight", prefix),
                vec![out_channels, in_channels, kernel, kernel],
            ),
            (format!("{}.bias", prefix), vec![out_channels]),
        ]
    }
}

impl Module for ConvBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = self.conv.forward(xs)?;
        if self.relu {
            ys.relu()
        } else {
            Ok(ys)
        }
    }
}

/// Apply a sequence of blocks
pub fn forward_all(blocks: &[ConvBlock], xs: &Tensor) -> Result<Tensor> {
    let mut ys = xs.clone();
    for block in blocks {
        ys = block.forward(&ys)?;
    }
    Ok(ys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_same_padding_keeps_spatial_dims() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let block = ConvBlock::new(3, 8, 7, true, vb.pp("conv"))?;
        let x = Tensor::randn(0f32, 1.0, (2, 3, 10, 12), &device)?;
        let y = block.forward(&x)?;

        assert_eq!(y.dims(), &[2, 8, 10, 12]);
        assert!(y.flatten_all()?.min(0)?.to_scalar::<f32>()? >= 0.0);
        assert_eq!(varmap.all_vars().len(), 2);

        Ok(())
    }

    #[test]
    fn test_zero_input_gives_zero_output() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let block = ConvBlock::new(4, 4, 3, false, vb)?;
        let x = Tensor::zeros((1, 4, 5, 5), DType::F32, &device)?;
        let y = block.forward(&x)?;

        assert_eq!(y.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);

        Ok(())
    }

    #[test]
    fn test_parameter_shapes() {
        let shapes = ConvBlock::parameter_shapes("conv1_1", 3, 64, 3);
        assert_eq!(shapes[0], ("conv1_1.weight".to_string(), vec![64, 3, 3, 3]));
        assert_eq!(shapes[1], ("conv1_1.bias".to_string(), vec![64]));
    }
}
