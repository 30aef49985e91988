//! Render bridge: the two texture slots behind the composite surface.
//!
//! Colour is written by source attach / new decoded frames, depth by
//! inference completion; the render tick only reads. Both slots live behind
//! one lock so a reader always gets a consistent pair.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use glam::{Vec2, vec2};
use tracing::trace;

use crate::{frame::Frame, pipeline::DepthField};

#[derive(Debug)]
pub struct ColorTexture {
    id: u64,
    frame: Frame,
}

impl ColorTexture {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }
}

#[derive(Debug)]
pub struct DepthTexture {
    id: u64,
    field: DepthField,
}

impl DepthTexture {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn field(&self) -> &DepthField {
        &self.field
    }
}

/// Consistent view of both texture slots at one generation.
#[derive(Clone, Debug, Default)]
pub struct CompositeSnapshot {
    pub color: Option<Arc<ColorTexture>>,
    pub depth: Option<Arc<DepthTexture>>,
    pub generation: u64,
}

impl CompositeSnapshot {
    pub fn is_empty(&self) -> bool {
        self.color.is_none() && self.depth.is_none()
    }
}

#[derive(Debug, Default)]
struct CompositeSurface {
    color: Option<Arc<ColorTexture>>,
    depth: Option<Arc<DepthTexture>>,
    generation: u64,
    next_texture_id: u64,
    needs_update: bool,
    released: u64,
    torn_down: bool,
}

impl CompositeSurface {
    fn snapshot(&self) -> CompositeSnapshot {
        CompositeSnapshot {
            color: self.color.clone(),
            depth: self.depth.clone(),
            generation: self.generation,
        }
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_texture_id += 1;
        self.next_texture_id
    }

    fn commit(&mut self, replaced: bool) {
        self.generation += 1;
        self.needs_update = true;
        if replaced {
            self.released += 1;
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RenderBridge {
    surface: Arc<Mutex<CompositeSurface>>,
}

impl RenderBridge {
    pub fn new() -> Self {
        Self::default()
    }

    fn surface(&self) -> MutexGuard<'_, CompositeSurface> {
        self.surface.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the colour texture. Returns `false` once torn down.
    pub fn set_color_source(&self, frame: Frame) -> bool {
        let previous = {
            let mut surface = self.surface();
            if surface.torn_down {
                return false;
            }
            let id = surface.allocate_id();
            let previous = surface.color.replace(Arc::new(ColorTexture { id, frame }));
            surface.commit(previous.is_some());
            previous
        };
        drop(previous);
        true
    }

    /// Replaces the depth texture, releasing the previous one.
    /// Returns `false` once torn down; late completions are ignored.
    pub fn set_depth_field(&self, field: DepthField) -> bool {
        let previous = {
            let mut surface = self.surface();
            if surface.torn_down {
                trace!("depth update after teardown ignored");
                return false;
            }
            let id = surface.allocate_id();
            let previous = surface.depth.replace(Arc::new(DepthTexture { id, field }));
            surface.commit(previous.is_some());
            previous
        };
        drop(previous);
        true
    }

    pub fn snapshot(&self) -> CompositeSnapshot {
        self.surface().snapshot()
    }

    /// Clears the dirty flag, returning the snapshot the material has to
    /// re-bind when something changed since the last call.
    pub fn take_update(&self) -> Option<CompositeSnapshot> {
        let mut surface = self.surface();
        if !surface.needs_update {
            return None;
        }
        surface.needs_update = false;
        Some(surface.snapshot())
    }

    /// Number of textures superseded so far.
    pub fn released_textures(&self) -> u64 {
        self.surface().released
    }

    pub fn is_torn_down(&self) -> bool {
        self.surface().torn_down
    }

    /// Drops both textures. Later writes are ignored.
    pub fn teardown(&self) {
        let (color, depth) = {
            let mut surface = self.surface();
            surface.torn_down = true;
            surface.needs_update = true;
            surface.generation += 1;
            (surface.color.take(), surface.depth.take())
        };
        drop((color, depth));
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompositeTile {
    Color,
    Depth,
}

/// Fixed compositing rule for the unit quad.
///
/// `position` is the quad-local position with both axes in `[-0.5, 0.5]`.
/// The right half (`x > 0`) samples colour at `position * (2, 1) + (0, 0.5)`;
/// the rest samples depth at `position * (2, -1) + (1, 0.5)`. Coordinates are
/// bottom-left origin, colour rows flipped like a video texture.
pub fn composite_lookup(position: Vec2) -> (CompositeTile, Vec2) {
    if position.x > 0.0 {
        (CompositeTile::Color, position * vec2(2.0, 1.0) + vec2(0.0, 0.5))
    } else {
        (CompositeTile::Depth, position * vec2(2.0, -1.0) + vec2(1.0, 0.5))
    }
}

/// Maps a [`composite_lookup`] result to top-left-origin texel space, the
/// convention textures are uploaded in.
pub fn texture_space(tile: CompositeTile, uv: Vec2) -> Vec2 {
    match tile {
        CompositeTile::Color => vec2(uv.x, 1.0 - uv.y),
        CompositeTile::Depth => uv,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::{thread, time::Duration};

    fn frame(value: u8, sequence: u64) -> Frame {
        Frame::new(
            RgbImage::from_pixel(2, 2, image::Rgb([value; 3])),
            sequence,
            Duration::ZERO,
        )
    }

    fn field(value: f32) -> DepthField {
        DepthField::new(2, 1, vec![value; 2]).unwrap()
    }

    #[test]
    fn replacing_a_texture_releases_the_previous_one() {
        let bridge = RenderBridge::new();
        assert!(bridge.set_depth_field(field(0.0)));
        assert_eq!(bridge.released_textures(), 0);

        let before = bridge.snapshot().depth.unwrap().id();
        assert!(bridge.set_depth_field(field(1.0)));
        let after = bridge.snapshot().depth.unwrap();

        assert_ne!(before, after.id());
        assert_eq!(after.field().values(), &[1.0, 1.0]);
        assert_eq!(bridge.released_textures(), 1);
    }

    #[test]
    fn dirty_flag_is_consumed_once_per_change() {
        let bridge = RenderBridge::new();
        assert!(bridge.take_update().is_none());

        bridge.set_color_source(frame(10, 1));
        bridge.set_depth_field(field(0.5));
        let update = bridge.take_update().unwrap();
        assert!(update.color.is_some() && update.depth.is_some());
        assert_eq!(update.generation, 2);
        assert!(bridge.take_update().is_none());
    }

    #[test]
    fn teardown_ignores_late_depth() {
        let bridge = RenderBridge::new();
        bridge.set_depth_field(field(0.2));
        bridge.teardown();

        assert!(bridge.is_torn_down());
        assert!(!bridge.set_depth_field(field(0.9)));
        assert!(!bridge.set_color_source(frame(1, 2)));
        assert!(bridge.snapshot().is_empty());
    }

    #[test]
    fn readers_never_observe_a_mixed_pair() {
        let bridge = RenderBridge::new();
        bridge.set_color_source(frame(0, 0));
        bridge.set_depth_field(field(0.0));

        let writer = {
            let bridge = bridge.clone();
            thread::spawn(move || {
                for step in 1..=500u64 {
                    let value = (step % 200) as u8;
                    // both slots carry the same marker once a step is complete
                    let mut surface = bridge.surface();
                    let color_id = surface.allocate_id();
                    let depth_id = surface.allocate_id();
                    surface.color = Some(Arc::new(ColorTexture {
                        id: color_id,
                        frame: frame(value, step),
                    }));
                    surface.depth = Some(Arc::new(DepthTexture {
                        id: depth_id,
                        field: field(step as f32),
                    }));
                    surface.commit(true);
                }
            })
        };

        for _ in 0..500 {
            let snapshot = bridge.snapshot();
            let color = snapshot.color.unwrap();
            let depth = snapshot.depth.unwrap();
            assert_eq!(
                color.frame().sequence() as f32,
                depth.field().values()[0],
                "snapshot mixed generations"
            );
        }
        writer.join().unwrap();
    }

    #[test]
    fn concurrent_setters_commit_whole_updates() {
        const WRITES: u64 = 400;

        let bridge = RenderBridge::new();
        bridge.set_color_source(frame(0, 0));
        bridge.set_depth_field(field(0.0));

        let color_writer = {
            let bridge = bridge.clone();
            thread::spawn(move || {
                for step in 1..=WRITES {
                    assert!(bridge.set_color_source(frame((step % 200) as u8, step)));
                }
            })
        };
        let depth_writer = {
            let bridge = bridge.clone();
            thread::spawn(move || {
                for step in 1..=WRITES {
                    assert!(bridge.set_depth_field(field(step as f32)));
                }
            })
        };

        let mut last_generation = 0;
        for _ in 0..2_000 {
            let snapshot = bridge.snapshot();
            let color = snapshot.color.unwrap();
            let depth = snapshot.depth.unwrap();

            // every commit bumps the generation once, so a pair read from one
            // commit accounts for exactly the writes it shows
            let colour_writes = color.frame().sequence();
            let depth_writes = depth.field().values()[0] as u64;
            assert_eq!(snapshot.generation, 2 + colour_writes + depth_writes);
            assert!(snapshot.generation >= last_generation);
            last_generation = snapshot.generation;

            assert!(depth.field().values().iter().all(|v| *v == depth_writes as f32));
            let expected = (colour_writes % 200) as u8;
            assert!(color.frame().image().pixels().all(|p| p.0 == [expected; 3]));
        }

        color_writer.join().unwrap();
        depth_writer.join().unwrap();

        let done = bridge.snapshot();
        assert_eq!(done.generation, 2 + 2 * WRITES);
        assert_eq!(bridge.released_textures(), 2 * WRITES);
    }

    #[test]
    fn right_half_samples_colour_left_half_samples_depth() {
        let (tile, uv) = composite_lookup(vec2(0.25, 0.0));
        assert_eq!(tile, CompositeTile::Color);
        assert_eq!(uv, vec2(0.5, 0.5));

        let (tile, uv) = composite_lookup(vec2(-0.25, 0.0));
        assert_eq!(tile, CompositeTile::Depth);
        assert_eq!(uv, vec2(0.5, 0.5));

        // seam belongs to depth
        assert_eq!(composite_lookup(vec2(0.0, 0.0)).0, CompositeTile::Depth);
    }

    #[test]
    fn both_tiles_are_upright_in_texel_space() {
        let top = 0.5;
        let (tile, uv) = composite_lookup(vec2(0.4, top));
        assert_eq!(texture_space(tile, uv).y, 0.0);

        let (tile, uv) = composite_lookup(vec2(-0.4, top));
        assert_eq!(texture_space(tile, uv).y, 0.0);

        let (tile, uv) = composite_lookup(vec2(-0.5, -0.5));
        assert_eq!(texture_space(tile, uv), vec2(0.0, 1.0));
    }
}
