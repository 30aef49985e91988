pub mod pydnet;

use burn::prelude::*;

pub use pydnet::{PyDNet, PyDNetConfig};

pub const DEFAULT_CHECKPOINT: &str = "assets/model/pydnet.mpk";

/// Opaque depth predictor.
///
/// Takes an image tensor `[1, 3, H, W]` with values in `[0, 1]` and returns a
/// raw depth tensor `[1, 1, H', W']` of unbounded, unrectified values.
pub trait DepthModel<B: Backend>: Send + 'static {
    fn predict(&self, input: Tensor<B, 4>) -> Tensor<B, 4>;
}

impl<B: Backend> DepthModel<B> for PyDNet<B> {
    fn predict(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.forward(input)
    }
}
