//! Render loop controller.
//!
//! Driven once per display refresh. While streaming, a tick delivers a
//! finished inference (if any) to the bridge, sizes the drawing buffer,
//! renders the current composite and, when the single inference slot is
//! free, issues a request for the latest frame. Requests never block a tick.

use std::future::Future;

use futures_lite::future;
use tracing::{debug, info, warn};

use crate::{
    bridge::{CompositeSnapshot, RenderBridge},
    error::Result,
    frame::{Frame, FrameSource},
    pipeline::DepthField,
    viewport::{CameraProjection, DrawingBuffer, Viewport},
};

/// Surface the controller draws through.
pub trait CompositeRenderer {
    fn set_drawing_buffer(&mut self, buffer: DrawingBuffer, projection: &CameraProjection);

    /// `changed` is set when the snapshot differs from the last rendered one.
    fn render(&mut self, snapshot: &CompositeSnapshot, changed: bool);
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StreamState {
    #[default]
    Idle,
    Streaming,
}

/// Single-slot queue holding the one in-flight inference request.
pub struct InferenceSlot<F> {
    pending: Option<F>,
}

impl<F> Default for InferenceSlot<F> {
    fn default() -> Self {
        Self { pending: None }
    }
}

impl<F> InferenceSlot<F>
where
    F: Future<Output = Result<DepthField>> + Unpin,
{
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Stores a new request when the slot is empty. Returns whether it did.
    pub fn try_issue(&mut self, request: impl FnOnce() -> F) -> bool {
        if self.pending.is_some() {
            return false;
        }
        self.pending = Some(request());
        true
    }

    /// Non-blocking check of the pending request.
    pub fn poll_completion(&mut self) -> Option<Result<DepthField>> {
        let task = self.pending.as_mut()?;
        let result = future::block_on(future::poll_once(task))?;
        self.pending = None;
        Some(result)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub ticks: u64,
    pub issued: u64,
    pub completed: u64,
    pub failed: u64,
    pub color_updates: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub state: StreamState,
    pub depth_updated: bool,
    pub inference_issued: bool,
    /// Set on the one tick that observes the source ending.
    pub source_ended: bool,
}

pub struct RenderLoopController<F> {
    state: StreamState,
    source: Option<Box<dyn FrameSource>>,
    bridge: RenderBridge,
    slot: InferenceSlot<F>,
    viewport: Viewport,
    drawing_buffer: DrawingBuffer,
    projection: CameraProjection,
    last_color_sequence: Option<u64>,
    last_rendered_generation: Option<u64>,
    ended: bool,
    stats: LoopStats,
}

impl<F> RenderLoopController<F>
where
    F: Future<Output = Result<DepthField>> + Unpin,
{
    pub fn new(bridge: RenderBridge, viewport: Viewport) -> Self {
        let drawing_buffer = viewport.drawing_buffer();
        Self {
            state: StreamState::Idle,
            source: None,
            bridge,
            slot: InferenceSlot::default(),
            viewport,
            drawing_buffer,
            projection: CameraProjection::default()
                .with_aspect_ratio(drawing_buffer.aspect_ratio()),
            last_color_sequence: None,
            last_rendered_generation: None,
            ended: false,
            stats: LoopStats::default(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    pub fn bridge(&self) -> &RenderBridge {
        &self.bridge
    }

    pub fn drawing_buffer(&self) -> DrawingBuffer {
        self.drawing_buffer
    }

    pub fn projection(&self) -> CameraProjection {
        self.projection
    }

    pub fn has_ended(&self) -> bool {
        self.ended
    }

    pub fn inference_pending(&self) -> bool {
        self.slot.is_pending()
    }

    /// Attaches a media source, moving Idle -> Streaming.
    ///
    /// The first available frame becomes the colour texture. Attaching while
    /// already streaming is ignored and returns `false`; there is no way back
    /// to Idle.
    pub fn attach_source(&mut self, mut source: Box<dyn FrameSource>) -> bool {
        if self.state == StreamState::Streaming {
            warn!("media source already attached, ignoring");
            return false;
        }

        if let Some(frame) = source.latest_frame() {
            self.push_color(frame);
        }

        self.source = Some(source);
        self.state = StreamState::Streaming;
        info!("media source attached, streaming");
        true
    }

    /// Applies a window resize. Returns `false` when nothing changed.
    pub fn resize(&mut self, viewport: Viewport) -> bool {
        let buffer = viewport.drawing_buffer();
        if viewport == self.viewport && buffer == self.drawing_buffer {
            return false;
        }

        self.viewport = viewport;
        self.drawing_buffer = buffer;
        self.projection = self.projection.with_aspect_ratio(buffer.aspect_ratio());
        debug!(
            width = buffer.width,
            height = buffer.height,
            aspect = self.projection.aspect_ratio,
            "viewport resized"
        );
        true
    }

    /// One render tick.
    ///
    /// `request` is only called when a new inference is issued; it must
    /// start the work without waiting for it.
    pub fn tick<R, S>(&mut self, renderer: &mut R, request: S) -> TickReport
    where
        R: CompositeRenderer,
        S: FnOnce(Frame) -> F,
    {
        self.stats.ticks += 1;

        let depth_updated = self.deliver_completed();

        if self.state == StreamState::Idle {
            let snapshot = CompositeSnapshot::default();
            let changed = self.last_rendered_generation.replace(0).is_none();
            renderer.render(&snapshot, changed);
            return TickReport::default();
        }

        let mut latest = None;
        let mut source_ended = false;
        if let Some(source) = self.source.as_mut() {
            latest = source.latest_frame();
            if !self.ended && source.has_ended() {
                self.ended = true;
                source_ended = true;
                info!("media source ended");
            }
        }
        if let Some(frame) = latest.as_ref() {
            self.push_color(frame.clone());
        }

        renderer.set_drawing_buffer(self.drawing_buffer, &self.projection);
        let snapshot = self.bridge.snapshot();
        let changed = self.last_rendered_generation != Some(snapshot.generation);
        self.last_rendered_generation = Some(snapshot.generation);
        renderer.render(&snapshot, changed);

        let mut inference_issued = false;
        if !self.ended {
            if let Some(frame) = latest {
                inference_issued = self.slot.try_issue(|| request(frame));
                if inference_issued {
                    self.stats.issued += 1;
                }
            }
        }

        TickReport {
            state: self.state,
            depth_updated,
            inference_issued,
            source_ended,
        }
    }

    /// Waits out the pending request, if any, and applies it.
    pub fn drain(&mut self) -> bool {
        let Some(task) = self.slot.pending.take() else {
            return false;
        };
        let result = future::block_on(task);
        self.apply(result)
    }

    fn deliver_completed(&mut self) -> bool {
        match self.slot.poll_completion() {
            Some(result) => self.apply(result),
            None => false,
        }
    }

    fn apply(&mut self, result: Result<DepthField>) -> bool {
        match result {
            Ok(field) => {
                self.stats.completed += 1;
                self.bridge.set_depth_field(field)
            }
            Err(err) => {
                self.stats.failed += 1;
                warn!("skipping depth update: {err}");
                false
            }
        }
    }

    fn push_color(&mut self, frame: Frame) {
        if self.last_color_sequence == Some(frame.sequence()) {
            return;
        }
        self.last_color_sequence = Some(frame.sequence());
        if self.bridge.set_color_source(frame) {
            self.stats.color_updates += 1;
        }
    }
}
