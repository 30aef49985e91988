//! Pyramidal depth network in the spirit of PyDNet.
//!
//! A strided convolution pyramid extracts features at `1/2 .. 1/2^L` of the
//! input resolution. Estimation starts at the coarsest level; each level's
//! hidden features are upsampled with a transposed convolution and
//! concatenated with the next finer level. The finest estimate (half
//! resolution) is bilinearly resized back to the input size.

use std::path::Path;

use burn::{
    module::{Ignored, Module},
    nn::{
        PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
    },
    prelude::*,
    record::{HalfPrecisionSettings, NamedMpkFileRecorder},
    tensor::{
        activation::leaky_relu,
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};

use crate::error::{DepthVideoError, Result};

#[derive(Config, Debug)]
pub struct PyDNetConfig {
    #[config(default = "vec![16, 32, 64, 96, 128, 192]")]
    pub pyramid_channels: Vec<usize>,

    #[config(default = "vec![96, 64, 32, 8]")]
    pub estimator_channels: Vec<usize>,

    #[config(default = 0.2)]
    pub leaky_slope: f64,
}

impl PyDNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PyDNet<B> {
        PyDNet::new(device, self.clone())
    }

    /// Input height and width have to be multiples of this value.
    pub fn size_multiple(&self) -> usize {
        1 << self.pyramid_channels.len()
    }
}

fn conv3x3<B: Backend>(
    device: &B::Device,
    channels: [usize; 2],
    stride: usize,
) -> Conv2d<B> {
    Conv2dConfig::new(channels, [3, 3])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

#[derive(Module, Debug)]
struct PyramidLevel<B: Backend> {
    downsample: Conv2d<B>,
    refine: Conv2d<B>,
}

impl<B: Backend> PyramidLevel<B> {
    fn new(device: &B::Device, channels: [usize; 2]) -> Self {
        Self {
            downsample: conv3x3(device, channels, 2),
            refine: conv3x3(device, [channels[1], channels[1]], 1),
        }
    }

    fn forward(&self, x: Tensor<B, 4>, slope: f64) -> Tensor<B, 4> {
        let x = leaky_relu(self.downsample.forward(x), slope);
        leaky_relu(self.refine.forward(x), slope)
    }
}

#[derive(Module, Debug)]
struct Estimator<B: Backend> {
    layers: Vec<Conv2d<B>>,
    disparity: Conv2d<B>,
}

impl<B: Backend> Estimator<B> {
    fn new(device: &B::Device, in_channels: usize, hidden: &[usize]) -> Self {
        let mut layers = Vec::with_capacity(hidden.len());
        let mut previous = in_channels;
        for &channels in hidden {
            layers.push(conv3x3(device, [previous, channels], 1));
            previous = channels;
        }

        Self {
            layers,
            disparity: conv3x3(device, [previous, 1], 1),
        }
    }

    /// Returns the last hidden activation and the raw single-channel estimate.
    fn forward(&self, mut x: Tensor<B, 4>, slope: f64) -> (Tensor<B, 4>, Tensor<B, 4>) {
        for layer in &self.layers {
            x = leaky_relu(layer.forward(x), slope);
        }
        let disparity = self.disparity.forward(x.clone());
        (x, disparity)
    }
}

#[derive(Module, Debug)]
pub struct PyDNet<B: Backend> {
    encoder: Vec<PyramidLevel<B>>,
    estimators: Vec<Estimator<B>>,
    upsamplers: Vec<ConvTranspose2d<B>>,
    leaky_slope: Ignored<f64>,
}

impl<B: Backend> PyDNet<B> {
    pub fn new(device: &B::Device, config: PyDNetConfig) -> Self {
        let levels = config.pyramid_channels.len();
        let hidden = *config.estimator_channels.last().unwrap_or(&1);

        let mut encoder = Vec::with_capacity(levels);
        let mut previous = 3;
        for &channels in &config.pyramid_channels {
            encoder.push(PyramidLevel::new(device, [previous, channels]));
            previous = channels;
        }

        let estimators = config
            .pyramid_channels
            .iter()
            .enumerate()
            .map(|(level, &channels)| {
                let in_channels = if level + 1 == levels {
                    channels
                } else {
                    channels + hidden
                };
                Estimator::new(device, in_channels, &config.estimator_channels)
            })
            .collect();

        let upsamplers = (1..levels)
            .map(|_| {
                ConvTranspose2dConfig::new([hidden, hidden], [2, 2])
                    .with_stride([2, 2])
                    .init(device)
            })
            .collect();

        Self {
            encoder,
            estimators,
            upsamplers,
            leaky_slope: Ignored(config.leaky_slope),
        }
    }

    pub fn load(
        device: &B::Device,
        config: PyDNetConfig,
        checkpoint_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let checkpoint_path = checkpoint_path.as_ref();
        let recorder = NamedMpkFileRecorder::<HalfPrecisionSettings>::new();
        Self::new(device, config)
            .load_file(checkpoint_path, &recorder, device)
            .map_err(|err| DepthVideoError::ModelLoad {
                path: checkpoint_path.to_path_buf(),
                reason: err.to_string(),
            })
    }

    pub fn levels(&self) -> usize {
        self.encoder.len()
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let slope = self.leaky_slope.0;
        let [_, _, height, width] = input.shape().dims::<4>();
        let device = input.device();

        let mut features = Vec::with_capacity(self.encoder.len());
        let mut x = input;
        for level in &self.encoder {
            x = level.forward(x, slope);
            features.push(x.clone());
        }

        let mut upsampled: Option<Tensor<B, 4>> = None;
        let mut estimate = None;
        for (level, feature) in features.into_iter().enumerate().rev() {
            let x = match upsampled.take() {
                Some(coarse) => {
                    let [_, _, h, w] = feature.shape().dims::<4>();
                    Tensor::cat(vec![feature, match_spatial(coarse, [h, w])], 1)
                }
                None => feature,
            };

            let (hidden, disparity) = self.estimators[level].forward(x, slope);
            if level > 0 {
                let up = self.upsamplers[level - 1].forward(hidden);
                upsampled = Some(leaky_relu(up, slope));
            }
            estimate = Some(disparity);
        }

        match estimate {
            Some(disparity) => match_spatial(disparity, [height, width]),
            None => Tensor::zeros([1, 1, height, width], &device),
        }
    }
}

fn match_spatial<B: Backend>(x: Tensor<B, 4>, size: [usize; 2]) -> Tensor<B, 4> {
    let [_, _, h, w] = x.shape().dims::<4>();
    if [h, w] == size {
        return x;
    }
    interpolate(x, size, InterpolateOptions::new(InterpolateMode::Bilinear))
}
