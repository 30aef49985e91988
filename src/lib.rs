#![recursion_limit = "256"]

pub mod bridge;
pub mod composite;
pub mod context;
pub mod controller;
pub mod error;
pub mod frame;
pub mod model;
pub mod pipeline;
pub mod recorder;
pub mod viewport;

pub use bridge::{CompositeSnapshot, RenderBridge};
pub use context::DepthVideoContext;
pub use controller::{CompositeRenderer, RenderLoopController, StreamState};
pub use error::{DepthVideoError, Result};
pub use frame::{Frame, FrameSource, StillSource};
pub use model::{DepthModel, PyDNet, PyDNetConfig};
pub use pipeline::{DepthField, DepthPipeline, DepthPipelineConfig, InterpolationMethod};
pub use recorder::{PendingRecording, RecordingArtifact, RecordingConfig, RecordingSession};
pub use viewport::{CameraProjection, DrawingBuffer, Viewport};

#[cfg(feature = "backend_wgpu")]
pub type InferenceBackend = burn::backend::Wgpu;

#[cfg(all(feature = "backend_cuda", not(feature = "backend_wgpu")))]
pub type InferenceBackend = burn::backend::Cuda;

#[cfg(all(
    feature = "backend_ndarray",
    not(any(feature = "backend_wgpu", feature = "backend_cuda"))
))]
pub type InferenceBackend = burn::backend::NdArray;
