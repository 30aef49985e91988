use std::path::PathBuf;

/// Failures surfaced by the depth video pipeline.
///
/// Only [`DepthVideoError::ModelLoad`] is fatal. Inference failures skip a
/// single depth update, codec failures disable recording, and a missing
/// source leaves the render loop idle.
#[derive(Debug, thiserror::Error)]
pub enum DepthVideoError {
    #[error("failed to load depth model `{path}`: {reason}")]
    ModelLoad { path: PathBuf, reason: String },

    #[error("depth inference failed: {0}")]
    ModelInference(String),

    #[error("unsupported recording codec `{0}`")]
    UnsupportedCodec(String),

    #[error("no media file selected")]
    NoFileSelected,

    #[error("video decode error: {0}")]
    Decode(String),

    #[error("recording encoder error: {0}")]
    Encode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DepthVideoError {
    /// Whether the render loop has to stop because of this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ModelLoad { .. })
    }
}

pub type Result<T, E = DepthVideoError> = std::result::Result<T, E>;
