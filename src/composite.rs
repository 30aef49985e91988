//! CPU rendition of the composite quad, for headless capture and tooling.

use glam::vec2;
use image::{Rgba, RgbaImage};

use crate::{
    bridge::{CompositeSnapshot, CompositeTile, composite_lookup, texture_space},
    controller::CompositeRenderer,
    viewport::{CameraProjection, DrawingBuffer},
};

const CLEAR: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Renders the quad face-on so it fills the whole drawing buffer.
#[derive(Debug, Default)]
pub struct SoftwareCompositor {
    buffer: DrawingBuffer,
    canvas: RgbaImage,
    frames: u64,
}

impl SoftwareCompositor {
    pub fn new(buffer: DrawingBuffer) -> Self {
        Self {
            buffer,
            canvas: RgbaImage::new(buffer.width, buffer.height),
            frames: 0,
        }
    }

    pub fn canvas(&self) -> &RgbaImage {
        &self.canvas
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames
    }

    fn shade(snapshot: &CompositeSnapshot, u: f32, v: f32) -> Rgba<u8> {
        // quad-local position, y up
        let (tile, uv) = composite_lookup(vec2(u - 0.5, 0.5 - v));
        let texel = texture_space(tile, uv);

        match tile {
            CompositeTile::Color => {
                let Some(color) = snapshot.color.as_ref() else {
                    return CLEAR;
                };
                let image = color.frame().image();
                if image.width() == 0 || image.height() == 0 {
                    return CLEAR;
                }
                let x = nearest(texel.x, image.width() as usize) as u32;
                let y = nearest(texel.y, image.height() as usize) as u32;
                let [r, g, b] = image.get_pixel(x, y).0;
                Rgba([r, g, b, 255])
            }
            CompositeTile::Depth => {
                let Some(depth) = snapshot.depth.as_ref() else {
                    return CLEAR;
                };
                let field = depth.field();
                let x = nearest(texel.x, field.width());
                let y = nearest(texel.y, field.height());
                let value = field.get(x, y).unwrap_or_default();
                Rgba([(value * 255.0).round().clamp(0.0, 255.0) as u8, 0, 0, 255])
            }
        }
    }
}

fn nearest(coordinate: f32, size: usize) -> usize {
    ((coordinate * size as f32).floor().max(0.0) as usize).min(size.saturating_sub(1))
}

impl CompositeRenderer for SoftwareCompositor {
    fn set_drawing_buffer(&mut self, buffer: DrawingBuffer, _projection: &CameraProjection) {
        if buffer != self.buffer {
            self.buffer = buffer;
            self.canvas = RgbaImage::new(buffer.width, buffer.height);
        }
    }

    fn render(&mut self, snapshot: &CompositeSnapshot, changed: bool) {
        self.frames += 1;
        if !changed && self.frames > 1 {
            return;
        }

        let (width, height) = self.canvas.dimensions();
        for (x, y, pixel) in self.canvas.enumerate_pixels_mut() {
            let u = (x as f32 + 0.5) / width as f32;
            let v = (y as f32 + 0.5) / height as f32;
            *pixel = Self::shade(snapshot, u, v);
        }
    }
}
