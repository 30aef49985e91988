use std::{future::Future, path::Path};

use burn::prelude::*;
use tracing::{info, warn};

use crate::{
    bridge::RenderBridge,
    controller::RenderLoopController,
    error::Result,
    model::{DepthModel, PyDNet, PyDNetConfig},
    pipeline::{DepthField, DepthPipeline, DepthPipelineConfig},
    recorder::{RecordingArtifact, RecordingConfig, RecordingSession},
    viewport::Viewport,
};

/// Everything the render loop and the recorder share, created in a fixed
/// order (model, pipeline, bridge, recorder) and torn down in one place.
pub struct DepthVideoContext<B: Backend, M: DepthModel<B>> {
    pipeline: DepthPipeline<B, M>,
    bridge: RenderBridge,
    recorder: RecordingSession,
}

impl<B: Backend> DepthVideoContext<B, PyDNet<B>> {
    /// Loads the depth network from `checkpoint`. Any failure here is a
    /// [`crate::DepthVideoError::ModelLoad`] and aborts startup.
    pub fn load(
        device: &B::Device,
        checkpoint: impl AsRef<Path>,
        model_config: PyDNetConfig,
        pipeline_config: DepthPipelineConfig,
        recording_config: RecordingConfig,
    ) -> Result<Self> {
        let checkpoint = checkpoint.as_ref();
        info!(checkpoint = %checkpoint.display(), "loading depth model");
        let model = PyDNet::load(device, model_config, checkpoint)?;
        let pipeline = DepthPipeline::new(model, device.clone(), pipeline_config);
        Ok(Self::new(pipeline, recording_config))
    }
}

impl<B: Backend, M: DepthModel<B>> DepthVideoContext<B, M> {
    pub fn new(pipeline: DepthPipeline<B, M>, recording_config: RecordingConfig) -> Self {
        Self {
            pipeline,
            bridge: RenderBridge::new(),
            recorder: RecordingSession::new(recording_config),
        }
    }

    pub fn pipeline(&self) -> &DepthPipeline<B, M> {
        &self.pipeline
    }

    pub fn bridge(&self) -> &RenderBridge {
        &self.bridge
    }

    pub fn recorder(&self) -> &RecordingSession {
        &self.recorder
    }

    pub fn recorder_mut(&mut self) -> &mut RecordingSession {
        &mut self.recorder
    }

    /// A controller drawing from this context's bridge.
    pub fn controller<F>(&self, viewport: Viewport) -> RenderLoopController<F>
    where
        F: Future<Output = Result<DepthField>> + Unpin,
    {
        RenderLoopController::new(self.bridge.clone(), viewport)
    }

    /// Starts recording; codec problems are logged and leave the rest of
    /// the pipeline running.
    pub fn start_recording(&mut self) -> bool {
        match self.recorder.start() {
            Ok(()) => true,
            Err(err) => {
                warn!("recording disabled: {err}");
                false
            }
        }
    }

    /// Single teardown entry point: drops both textures (late inference
    /// results are ignored from here on) and stops any active recording,
    /// waiting for its encoder. An encoder failure is returned after the
    /// textures are released.
    pub fn teardown(&mut self) -> Result<Option<RecordingArtifact>> {
        self.bridge.teardown();
        self.recorder.stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::DepthVideoError, frame::Frame};
    use image::{Rgb, RgbImage, RgbaImage};
    use std::time::Duration;

    type TestBackend = burn::backend::NdArray<f32>;

    struct Identity;

    impl DepthModel<TestBackend> for Identity {
        fn predict(&self, input: Tensor<TestBackend, 4>) -> Tensor<TestBackend, 4> {
            input.mean_dim(1)
        }
    }

    fn context(mime_type: &str) -> DepthVideoContext<TestBackend, Identity> {
        let pipeline = DepthPipeline::new(
            Identity,
            Default::default(),
            DepthPipelineConfig::new()
                .with_input_height(4)
                .with_input_width(4),
        );
        let recording = RecordingConfig {
            mime_type: mime_type.to_string(),
            ..RecordingConfig::default()
        };
        DepthVideoContext::new(pipeline, recording)
    }

    #[test]
    fn missing_checkpoint_is_fatal() {
        let result = DepthVideoContext::<TestBackend, PyDNet<TestBackend>>::load(
            &Default::default(),
            "does/not/exist.mpk",
            PyDNetConfig::new(),
            DepthPipelineConfig::new(),
            RecordingConfig::default(),
        );
        let err = result.err().expect("load should fail");
        assert!(matches!(err, DepthVideoError::ModelLoad { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn controller_shares_the_context_bridge() {
        let context = context("image/gif");
        let controller = context.controller::<futures_lite::future::Ready<Result<DepthField>>>(
            Viewport::default(),
        );

        let image = RgbImage::from_fn(4, 4, |x, _| Rgb([(x * 60) as u8; 3]));
        let depth = context
            .pipeline()
            .infer_blocking(&Frame::still(image))
            .unwrap();
        assert!(controller.bridge().set_depth_field(depth));
        assert!(context.bridge().snapshot().depth.is_some());
    }

    #[test]
    fn unsupported_codec_keeps_pipeline_running() {
        let mut context = context("video/x-unknown");
        assert!(!context.start_recording());
        assert!(!context.recorder().is_active());
        assert!(context.teardown().unwrap().is_none());
    }

    #[test]
    fn teardown_stops_recording_and_releases_textures() {
        let mut context = context("image/gif");
        assert!(context.start_recording());

        for step in 0..4u64 {
            let canvas = RgbaImage::from_pixel(4, 4, image::Rgba([step as u8 * 40, 0, 0, 255]));
            context
                .recorder_mut()
                .push_frame(canvas, Duration::from_millis(step * 400))
                .unwrap();
        }
        context
            .bridge()
            .set_depth_field(DepthField::new(1, 1, vec![0.0]).unwrap());

        let artifact = context
            .teardown()
            .unwrap()
            .expect("active recording yields an artifact");
        assert!(!artifact.is_empty());
        assert!(context.bridge().is_torn_down());
        assert!(context.bridge().snapshot().is_empty());
        assert!(context.recorder().is_stopped());
        assert!(context.teardown().unwrap().is_none());
    }

    #[test]
    fn failed_encoder_still_releases_textures() {
        let mut context = context("image/gif");
        assert!(context.start_recording());
        context
            .recorder_mut()
            .push_frame(RgbaImage::new(0, 0), Duration::ZERO)
            .unwrap();
        context
            .bridge()
            .set_depth_field(DepthField::new(1, 1, vec![0.0]).unwrap());

        assert!(matches!(context.teardown(), Err(DepthVideoError::Encode(_))));
        assert!(context.bridge().is_torn_down());
        assert!(context.bridge().snapshot().is_empty());
    }
}
