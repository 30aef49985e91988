#[cfg(feature = "ffmpeg")]
pub mod video;

use std::path::Path;

use bevy::log::info;
use burn_video_depth::{DepthVideoError, FrameSource, Result, StillSource};

/// Opens the media the viewer was pointed at. An image path wins over a
/// video path; neither is [`DepthVideoError::NoFileSelected`].
pub fn open_source(
    video_path: Option<&Path>,
    image_path: Option<&Path>,
) -> Result<Box<dyn FrameSource>> {
    if let Some(path) = image_path {
        let image = image::open(path)
            .map_err(|err| DepthVideoError::Decode(format!("{}: {err}", path.display())))?
            .to_rgb8();
        info!("streaming still image {}", path.display());
        return Ok(Box::new(StillSource::new(image)));
    }

    match video_path {
        Some(path) => open_video(path),
        None => Err(DepthVideoError::NoFileSelected),
    }
}

#[cfg(feature = "ffmpeg")]
fn open_video(path: &Path) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(video::VideoPlayback::open(path)?))
}

#[cfg(not(feature = "ffmpeg"))]
fn open_video(path: &Path) -> Result<Box<dyn FrameSource>> {
    Err(DepthVideoError::Decode(format!(
        "cannot play {}: built without the `ffmpeg` feature",
        path.display()
    )))
}
