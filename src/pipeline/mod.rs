mod resize;

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, PoisonError},
};

use burn::{prelude::*, tensor::activation::relu};
use image::GrayImage;
use tracing::debug;

pub use resize::{InterpolationMethod, resize_bilinear};

use crate::{
    error::{DepthVideoError, Result},
    frame::Frame,
    model::DepthModel,
};

#[derive(Config, Debug)]
pub struct DepthPipelineConfig {
    #[config(default = 384)]
    pub input_height: usize,

    #[config(default = 640)]
    pub input_width: usize,

    #[config(default = "InterpolationMethod::Legacy")]
    pub interpolation: InterpolationMethod,
}

/// Single-channel depth, row-major, min-max normalized to `[0, 1]` per frame.
///
/// Values are relative within one frame only.
#[derive(Clone, Debug, PartialEq)]
pub struct DepthField {
    width: usize,
    height: usize,
    values: Vec<f32>,
}

impl DepthField {
    pub fn new(width: usize, height: usize, values: Vec<f32>) -> Option<Self> {
        (width.checked_mul(height)? == values.len()).then_some(Self {
            width,
            height,
            values,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn get(&self, x: usize, y: usize) -> Option<f32> {
        (x < self.width && y < self.height).then(|| self.values[y * self.width + x])
    }

    /// 8-bit grayscale rendering, `0` far/low and `255` at the frame maximum.
    pub fn to_luma8(&self) -> Option<GrayImage> {
        let pixels = self
            .values
            .iter()
            .map(|value| (value * 255.0).round().clamp(0.0, 255.0) as u8)
            .collect();
        GrayImage::from_raw(self.width as u32, self.height as u32, pixels)
    }
}

/// Frame -> [`DepthField`] conversion around an opaque [`DepthModel`].
pub struct DepthPipeline<B: Backend, M: DepthModel<B>> {
    model: Arc<Mutex<M>>,
    device: B::Device,
    config: DepthPipelineConfig,
}

impl<B: Backend, M: DepthModel<B>> Clone for DepthPipeline<B, M> {
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone(),
            device: self.device.clone(),
            config: self.config.clone(),
        }
    }
}

/// Packs an RGB frame into a `[height, width, 3]` float tensor of raw 8-bit intensities.
fn frame_to_tensor<B: Backend>(frame: &Frame, device: &B::Device) -> Tensor<B, 3> {
    let data: Vec<f32> = frame.rgb().iter().map(|&value| value as f32).collect();
    Tensor::<B, 1>::from_floats(data.as_slice(), device).reshape([
        frame.height() as i32,
        frame.width() as i32,
        3,
    ])
}

impl<B: Backend, M: DepthModel<B>> DepthPipeline<B, M> {
    pub fn new(model: M, device: B::Device, config: DepthPipelineConfig) -> Self {
        Self {
            model: Arc::new(Mutex::new(model)),
            device,
            config,
        }
    }

    pub fn config(&self) -> &DepthPipelineConfig {
        &self.config
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Runs one frame through resize, normalization, prediction and
    /// min-max post-processing.
    ///
    /// Every intermediate tensor is owned by this call and dropped on every
    /// exit path. The result is read back to host memory before returning.
    pub async fn infer(&self, frame: &Frame) -> Result<DepthField> {
        if frame.is_empty() {
            return Err(DepthVideoError::ModelInference(format!(
                "frame source has zero dimensions ({}x{})",
                frame.width(),
                frame.height()
            )));
        }

        let target = [self.config.input_height, self.config.input_width];
        if target.contains(&0) {
            return Err(DepthVideoError::ModelInference(format!(
                "model input resolution {}x{} is empty",
                target[1], target[0]
            )));
        }

        let raw = frame_to_tensor::<B>(frame, &self.device);
        let batched = raw.permute([2, 0, 1]).unsqueeze::<4>();
        let resized = resize_bilinear(batched, target, self.config.interpolation)?;
        let input = resized.div_scalar(255.0);

        let prediction = self.predict(input)?;
        let depth = rectify_and_squeeze(prediction)?;
        let [height, width] = depth.dims();

        let min_value = depth
            .clone()
            .min()
            .into_scalar_async()
            .await
            .elem::<f32>();
        let max_value = depth
            .clone()
            .max()
            .into_scalar_async()
            .await
            .elem::<f32>();

        if !min_value.is_finite() || !max_value.is_finite() {
            return Err(DepthVideoError::ModelInference(format!(
                "predictor produced non-finite depth (min {min_value}, max {max_value})"
            )));
        }

        let normalized = if max_value > min_value {
            depth
                .sub_scalar(min_value)
                .div_scalar(max_value - min_value)
                .clamp(0.0, 1.0)
        } else {
            depth.zeros_like()
        };

        let values = normalized
            .into_data_async()
            .await
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|err| {
                DepthVideoError::ModelInference(format!("failed to read depth tensor: {err:?}"))
            })?;

        debug!(
            frame = frame.sequence(),
            width, height, min_value, max_value, "depth inference complete"
        );

        DepthField::new(width, height, values).ok_or_else(|| {
            DepthVideoError::ModelInference("depth readback size mismatch".to_string())
        })
    }

    /// Blocking variant of [`DepthPipeline::infer`] for tools and tests.
    pub fn infer_blocking(&self, frame: &Frame) -> Result<DepthField> {
        futures_lite::future::block_on(self.infer(frame))
    }

    fn predict(&self, input: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        let model = self.model.lock().unwrap_or_else(PoisonError::into_inner);
        panic::catch_unwind(AssertUnwindSafe(|| model.predict(input)))
            .map_err(|_| DepthVideoError::ModelInference("depth predictor panicked".to_string()))
    }
}

/// Clips negatives to zero and drops the batch and channel axes.
fn rectify_and_squeeze<B: Backend>(prediction: Tensor<B, 4>) -> Result<Tensor<B, 2>> {
    let dims: [usize; 4] = prediction.dims();
    if dims[0] != 1 || dims[1] != 1 || dims[2] == 0 || dims[3] == 0 {
        return Err(DepthVideoError::ModelInference(format!(
            "expected depth tensor of shape [1, 1, H, W], got {dims:?}"
        )));
    }

    Ok(relu(prediction).squeeze_dim::<3>(0).squeeze_dim::<2>(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::time::Duration;

    type TestBackend = burn::backend::NdArray<f32>;

    /// Depth equal to the mean intensity minus an offset, so negatives occur.
    struct MeanIntensity {
        offset: f32,
    }

    impl DepthModel<TestBackend> for MeanIntensity {
        fn predict(&self, input: Tensor<TestBackend, 4>) -> Tensor<TestBackend, 4> {
            input.mean_dim(1).sub_scalar(self.offset)
        }
    }

    struct WrongShape;

    impl DepthModel<TestBackend> for WrongShape {
        fn predict(&self, input: Tensor<TestBackend, 4>) -> Tensor<TestBackend, 4> {
            input
        }
    }

    struct Panicking;

    impl DepthModel<TestBackend> for Panicking {
        fn predict(&self, _input: Tensor<TestBackend, 4>) -> Tensor<TestBackend, 4> {
            panic!("backend fault")
        }
    }

    fn small_config() -> DepthPipelineConfig {
        DepthPipelineConfig::new()
            .with_input_height(6)
            .with_input_width(8)
    }

    fn gradient_frame(width: u32, height: u32) -> Frame {
        let image = RgbImage::from_fn(width, height, |x, y| {
            let value = ((x + y) * 255 / (width + height - 2)) as u8;
            Rgb([value, value, value])
        });
        Frame::new(image, 1, Duration::ZERO)
    }

    fn pipeline<M: DepthModel<TestBackend>>(model: M) -> DepthPipeline<TestBackend, M> {
        DepthPipeline::new(model, Default::default(), small_config())
    }

    #[test]
    fn default_config_uses_fixed_model_resolution() {
        let config = DepthPipelineConfig::new();
        assert_eq!((config.input_height, config.input_width), (384, 640));
        assert_eq!(config.interpolation, InterpolationMethod::Legacy);
    }

    #[test]
    fn depth_is_normalized_with_exact_extremes() {
        let pipeline = pipeline(MeanIntensity { offset: 0.0 });
        let depth = pipeline.infer_blocking(&gradient_frame(32, 20)).unwrap();

        assert_eq!((depth.width(), depth.height()), (8, 6));
        assert!(depth.values().iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(depth.values().contains(&0.0));
        assert!(depth.values().contains(&1.0));
    }

    #[test]
    fn negative_predictions_are_rectified() {
        let pipeline = pipeline(MeanIntensity { offset: 0.5 });
        let depth = pipeline.infer_blocking(&gradient_frame(32, 20)).unwrap();

        // everything below the offset collapses to the new minimum
        let zeros = depth.values().iter().filter(|v| **v == 0.0).count();
        assert!(zeros > 1);
        assert!(depth.values().contains(&1.0));
    }

    #[test]
    fn uniform_frame_falls_back_to_zero() {
        let pipeline = pipeline(MeanIntensity { offset: 0.0 });
        let frame = Frame::still(RgbImage::from_pixel(10, 10, Rgb([90, 90, 90])));
        let depth = pipeline.infer_blocking(&frame).unwrap();

        assert!(depth.values().iter().all(|v| *v == 0.0));
        assert!(depth.values().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn inference_is_deterministic() {
        let pipeline = pipeline(MeanIntensity { offset: 0.1 });
        let frame = gradient_frame(17, 11);
        let first = pipeline.infer_blocking(&frame).unwrap();
        let second = pipeline.infer_blocking(&frame.clone()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn empty_frame_is_an_inference_error() {
        let pipeline = pipeline(MeanIntensity { offset: 0.0 });
        let frame = Frame::still(RgbImage::new(0, 0));
        let result = pipeline.infer_blocking(&frame);
        assert!(matches!(result, Err(DepthVideoError::ModelInference(_))));
    }

    #[test]
    fn malformed_prediction_shape_is_an_inference_error() {
        let pipeline = pipeline(WrongShape);
        let result = pipeline.infer_blocking(&gradient_frame(8, 6));
        assert!(matches!(result, Err(DepthVideoError::ModelInference(_))));
    }

    #[test]
    fn predictor_panic_is_an_inference_error_and_pipeline_survives() {
        let failing = pipeline(Panicking);
        let result = failing.infer_blocking(&gradient_frame(8, 6));
        assert!(matches!(result, Err(DepthVideoError::ModelInference(_))));

        let again = failing.infer_blocking(&gradient_frame(8, 6));
        assert!(matches!(again, Err(DepthVideoError::ModelInference(_))));
    }

    #[test]
    fn pydnet_runs_through_the_pipeline() {
        use crate::model::PyDNetConfig;

        let device = Default::default();
        let model = PyDNetConfig::new()
            .with_pyramid_channels(vec![4, 8])
            .with_estimator_channels(vec![4])
            .init::<TestBackend>(&device);
        let pipeline = DepthPipeline::new(model, device, small_config());

        let depth = pipeline.infer_blocking(&gradient_frame(16, 12)).unwrap();
        assert_eq!(depth.values().len(), 48);
        assert!(depth.values().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn luma_rendering_spans_full_range() {
        let field = DepthField::new(2, 1, vec![0.0, 1.0]).unwrap();
        let gray = field.to_luma8().unwrap();
        assert_eq!(gray.as_raw(), &vec![0u8, 255]);
        assert!(DepthField::new(2, 2, vec![0.0; 3]).is_none());
        assert_eq!(field.get(1, 0), Some(1.0));
        assert_eq!(field.get(2, 0), None);
    }
}
