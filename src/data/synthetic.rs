/// Constant-valued sample producer for smoke runs and tests
use candle_core::{Device, Tensor};

use super::{Sample, SampleProducer};
use crate::config::SampleShape;

pub struct SyntheticProducer {
    shape: SampleShape,
    len: usize,
    cursor: usize,
    pixel: f32,
    target: f32,
}

impl SyntheticProducer {
    /// `len` samples per pass with the given pixel and target values
    pub fn new(shape: SampleShape, len: usize, pixel: f32, target: f32) -> Self {
        Self {
            shape,
            len,
            cursor: 0,
            pixel,
            target,
        }
    }

    /// Zero-valued images and targets
    pub fn zeros(shape: SampleShape, len: usize) -> Self {
        Self::new(shape, len, 0.0, 0.0)
    }

    /// Split `total` samples into at most `n` non-empty producers of
    /// near-equal length
    pub fn sharded(shape: SampleShape, total: usize, n: usize) -> Vec<Self> {
        let n = n.min(total).max(1);
        (0..n)
            .map(|i| Self::zeros(shape, total / n + usize::from(i < total % n)))
            .collect()
    }

    fn build(&self) -> crate::Result<Sample> {
        let device = Device::Cpu;
        Ok(Sample {
            image: Tensor::full(self.pixel, &self.shape.image_dims(), &device)?,
            heatmap: Tensor::full(self.target, &self.shape.heatmap_dims(), &device)?,
            paf: Tensor::full(self.target, &self.shape.paf_dims(), &device)?,
        })
    }
}

impl SampleProducer for SyntheticProducer {
    fn len(&self) -> usize {
        self.len
    }

    fn next_sample(&mut self) -> Option<crate::Result<Sample>> {
        if self.cursor >= self.len {
            return None;
        }
        self.cursor += 1;
        Some(self.build())
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }
}
