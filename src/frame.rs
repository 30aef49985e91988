use std::{sync::Arc, time::Duration};

use image::RgbImage;

/// A decoded video frame. Cheap to clone; pixel storage is shared and
/// never mutated after construction.
#[derive(Clone, Debug)]
pub struct Frame {
    image: Arc<RgbImage>,
    sequence: u64,
    timestamp: Duration,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64, timestamp: Duration) -> Self {
        Self {
            image: Arc::new(image),
            sequence,
            timestamp,
        }
    }

    /// Wraps a still image as the first frame of a stream.
    pub fn still(image: RgbImage) -> Self {
        Self::new(image, 0, Duration::ZERO)
    }

    /// Builds a frame from packed RGB bytes, `width * height * 3` long.
    pub fn from_rgb(
        width: u32,
        height: u32,
        rgb: Vec<u8>,
        sequence: u64,
        timestamp: Duration,
    ) -> Option<Self> {
        RgbImage::from_raw(width, height, rgb).map(|image| Self::new(image, sequence, timestamp))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn rgb(&self) -> &[u8] {
        self.image.as_raw()
    }

    /// Monotonic index assigned by the source.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Presentation time relative to the start of the stream.
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }
}

/// Anything that can hand the render loop its most recent frame.
///
/// Mirrors a playing media element: the source advances on its own clock,
/// the render loop only ever samples whatever is current.
pub trait FrameSource: Send + Sync {
    fn latest_frame(&mut self) -> Option<Frame>;

    /// True once the source has signalled end of stream.
    fn has_ended(&self) -> bool;
}

/// Endless single-frame source used for still images.
#[derive(Clone, Debug)]
pub struct StillSource {
    frame: Frame,
}

impl StillSource {
    pub fn new(image: RgbImage) -> Self {
        Self {
            frame: Frame::still(image),
        }
    }
}

impl FrameSource for StillSource {
    fn latest_frame(&mut self) -> Option<Frame> {
        Some(self.frame.clone())
    }

    fn has_ended(&self) -> bool {
        false
    }
}
