use glam::Mat4;

/// Logical viewport plus the display's device pixel ratio.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub width: f32,
    pub height: f32,
    pub device_pixel_ratio: f32,
}

impl Viewport {
    pub fn new(width: f32, height: f32, device_pixel_ratio: f32) -> Self {
        Self {
            width,
            height,
            device_pixel_ratio,
        }
    }

    /// Backing-store size in physical pixels, truncated like a canvas
    /// dimension assignment.
    pub fn drawing_buffer(&self) -> DrawingBuffer {
        let scale = |logical: f32| (logical * self.device_pixel_ratio).max(0.0) as u32;
        DrawingBuffer {
            width: scale(self.width),
            height: scale(self.height),
        }
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::new(1024.0, 1024.0, 1.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrawingBuffer {
    pub width: u32,
    pub height: u32,
}

impl DrawingBuffer {
    pub fn aspect_ratio(&self) -> f32 {
        if self.width == 0 || self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}

/// Perspective camera parameters for the composite scene.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraProjection {
    pub fov_y_radians: f32,
    pub aspect_ratio: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for CameraProjection {
    fn default() -> Self {
        Self {
            fov_y_radians: 90f32.to_radians(),
            aspect_ratio: 1.0,
            near: 0.01,
            far: 10.0,
        }
    }
}

impl CameraProjection {
    pub fn with_aspect_ratio(self, aspect_ratio: f32) -> Self {
        Self {
            aspect_ratio,
            ..self
        }
    }

    pub fn matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y_radians, self.aspect_ratio, self.near, self.far)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drawing_buffer_scales_by_pixel_ratio() {
        let buffer = Viewport::new(800.0, 600.0, 2.0).drawing_buffer();
        assert_eq!(buffer, DrawingBuffer { width: 1600, height: 1200 });

        let fractional = Viewport::new(1001.0, 333.0, 1.5).drawing_buffer();
        assert_eq!(fractional, DrawingBuffer { width: 1501, height: 499 });
    }

    #[test]
    fn degenerate_buffer_keeps_unit_aspect() {
        let buffer = Viewport::new(0.0, 0.0, 2.0).drawing_buffer();
        assert_eq!(buffer.aspect_ratio(), 1.0);
    }

    #[test]
    fn projection_matrix_tracks_aspect() {
        let projection = CameraProjection::default().with_aspect_ratio(2.0);
        let matrix = projection.matrix();
        // x scale = y scale / aspect
        assert!((matrix.y_axis.y / matrix.x_axis.x - 2.0).abs() < 1e-5);
        // 90 degree vertical fov gives unit y scale
        assert!((matrix.y_axis.y - 1.0).abs() < 1e-5);
    }
}
