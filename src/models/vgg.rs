/// VGG-19 front end (conv1_1 .. conv4_2)
///
/// Four blocks of 3x3 convolutions with ReLU, separated by three 2x2 max
/// pools, for a 512-channel map at stride 8.
use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

use super::BackboneNet;
use crate::layers::ConvBlock;

/// (name, in, out) per conv; `None` is a 2x2 max pool
const LAYOUT: [Option<(&str, usize, usize)>; 13] = [
    Some(("conv1_1", 3, 64)),
    Some(("conv1_2", 64, 64)),
    None,
    Some(("conv2_1", 64, 128)),
    Some(("conv2_2", 128, 128)),
    None,
    Some(("conv3_1", 128, 256)),
    Some(("conv3_2", 256, 256)),
    Some(("conv3_3", 256, 256)),
    Some(("conv3_4", 256, 256)),
    None,
    Some(("conv4_1", 256, 512)),
    Some(("conv4_2", 512, 512)),
];

pub const VGG_OUT_CHANNELS: usize = 512;
pub const VGG_STRIDE: usize = 8;

enum Layer {
    Conv(ConvBlock),
    Pool,
}

pub struct Vgg19Backbone {
    layers: Vec<Layer>,
}

impl Vgg19Backbone {
    /// Build from a VarBuilder; every tensor must already exist with the
    /// expected shape when the builder is backed by a snapshot.
    pub fn new(vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(LAYOUT.len());
        for entry in LAYOUT {
            layers.push(match entry {
                Some((name, cin, cout)) => Layer::Conv(ConvBlock::new(cin, cout, 3, true, vb.pp(name))?),
                None => Layer::Pool,
            });
        }
        Ok(Self { layers })
    }

    /// Names and shapes a backbone snapshot must provide
    pub fn parameter_shapes() -> Vec<(String, Vec<usize>)> {
        LAYOUT
            .iter()
            .flatten()
            .flat_map(|(name, cin, cout)| ConvBlock::parameter_shapes(name, *cin, *cout, 3))
            .collect()
    }
}

impl BackboneNet for Vgg19Backbone {
    fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let mut xs = images.clone();
        for layer in &self.layers {
            xs = match layer {
                Layer::Conv(conv) => conv.forward(&xs)?,
                Layer::Pool => xs.max_pool2d(2)?,
            };
        }
        Ok(xs)
    }

    fn out_channels(&self) -> usize {
        VGG_OUT_CHANNELS
    }

    fn stride(&self) -> usize {
        VGG_STRIDE
    }
}
