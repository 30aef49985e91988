//! Capture/record pipeline.
//!
//! Rendered frames are sampled at a fixed rate and handed to an encoder
//! thread, which delivers the encoded stream as ordered byte chunks, one per
//! slice interval. Stopping is terminal and concatenates every chunk into a
//! single artifact.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
        mpsc::{self, Receiver, SyncSender, TrySendError},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use image::{
    Delay, RgbaImage,
    codecs::gif::{GifEncoder, Repeat},
    imageops::{self, FilterType},
};
use tracing::{debug, info};

use crate::error::{DepthVideoError, Result};

/// NeuQuant sampling factor for GIF palettes (1 best, 30 fastest).
const GIF_SPEED: i32 = 20;

#[derive(Clone, Debug)]
pub struct RecordingConfig {
    pub mime_type: String,
    pub frame_rate: u32,
    pub slice_interval: Duration,
    pub file_stem: String,
    /// Frames waiting for the encoder. Captures beyond this are dropped.
    pub queue_depth: usize,
    /// Longest side of the encoded canvas; larger captures are downscaled.
    pub max_dimension: u32,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            mime_type: RecordingCodec::Gif.mime_type().to_string(),
            frame_rate: 30,
            slice_interval: Duration::from_secs(1),
            file_stem: "recordingVideo".to_string(),
            queue_depth: 8,
            max_dimension: 512,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordingCodec {
    Gif,
}

impl RecordingCodec {
    /// Resolves a mime type such as `image/gif` or `video/webm; codecs=vp9`.
    pub fn from_mime(mime: &str) -> Result<Self> {
        let essence = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match essence.as_str() {
            "image/gif" => Ok(Self::Gif),
            _ => Err(DepthVideoError::UnsupportedCodec(mime.to_string())),
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Gif => "image/gif",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Gif => "gif",
        }
    }
}

/// Fixed-rate sampler over stream time. Missed samples are skipped, not
/// replayed.
#[derive(Clone, Debug)]
pub struct CaptureClock {
    interval: Duration,
    next_due: Option<Duration>,
}

impl CaptureClock {
    pub fn new(frame_rate: u32) -> Self {
        Self {
            interval: Duration::from_secs(1) / frame_rate.max(1),
            next_due: None,
        }
    }

    pub fn is_due(&mut self, now: Duration) -> bool {
        let due = self.next_due.unwrap_or(now);
        if now < due {
            return false;
        }

        let mut next = due + self.interval;
        while next <= now {
            next += self.interval;
        }
        self.next_due = Some(next);
        true
    }
}

/// The downloadable result of a stopped session.
#[derive(Clone, Debug)]
pub struct RecordingArtifact {
    pub bytes: Vec<u8>,
    pub chunk_lengths: Vec<usize>,
    pub dropped_frames: usize,
    pub mime_type: &'static str,
    pub file_name: String,
}

impl RecordingArtifact {
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn save_to(&self, directory: impl AsRef<Path>) -> Result<PathBuf> {
        let directory = directory.as_ref();
        fs::create_dir_all(directory)?;
        let path = directory.join(&self.file_name);
        fs::write(&path, &self.bytes)?;
        info!(path = %path.display(), bytes = self.bytes.len(), "recording saved");
        Ok(path)
    }
}

#[derive(Clone, Default)]
struct SliceBuffer(Arc<Mutex<Vec<u8>>>);

impl SliceBuffer {
    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Write for SliceBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

type ChunkList = Arc<Mutex<Vec<Vec<u8>>>>;

enum EncoderCommand {
    Frame { image: RgbaImage, timestamp: Duration },
    Stop,
}

struct EncoderWorker {
    codec: RecordingCodec,
    frame_rate: u32,
    slice_interval: Duration,
    max_dimension: u32,
    chunks: ChunkList,
    queued: Arc<AtomicUsize>,
}

/// Size of the encoded canvas for a first capture of `width`x`height`.
fn encoded_size(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let longest = width.max(height);
    if max_dimension == 0 || longest <= max_dimension {
        return (width, height);
    }
    let scale = max_dimension as f64 / longest as f64;
    (
        ((width as f64 * scale).round() as u32).max(1),
        ((height as f64 * scale).round() as u32).max(1),
    )
}

impl EncoderWorker {
    fn deliver(&self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        debug!(bytes = chunk.len(), "recording chunk available");
        self.chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(chunk);
    }

    fn run(self, commands: Receiver<EncoderCommand>) -> Result<()> {
        let buffer = SliceBuffer::default();
        let mut encoder = match self.codec {
            RecordingCodec::Gif => GifEncoder::new_with_speed(buffer.clone(), GIF_SPEED),
        };
        encoder
            .set_repeat(Repeat::Infinite)
            .map_err(|err| DepthVideoError::Encode(err.to_string()))?;

        let delay = Delay::from_numer_denom_ms(1000, self.frame_rate.max(1));
        let mut canvas_size = None;
        let mut slice_start = None;

        while let Ok(command) = commands.recv() {
            let EncoderCommand::Frame { image, timestamp } = command else {
                break;
            };
            self.queued.fetch_sub(1, Ordering::AcqRel);

            if image.width() == 0 || image.height() == 0 {
                return Err(DepthVideoError::Encode(
                    "captured canvas has zero dimensions".to_string(),
                ));
            }

            let (width, height) = *canvas_size.get_or_insert_with(|| {
                encoded_size(image.width(), image.height(), self.max_dimension)
            });
            let image = if image.dimensions() == (width, height) {
                image
            } else {
                imageops::resize(&image, width, height, FilterType::Triangle)
            };

            encoder
                .encode_frame(image::Frame::from_parts(image, 0, 0, delay))
                .map_err(|err| DepthVideoError::Encode(err.to_string()))?;

            let start = *slice_start.get_or_insert(timestamp);
            if timestamp.saturating_sub(start) >= self.slice_interval {
                self.deliver(buffer.take());
                slice_start = Some(timestamp);
            }
        }

        // the trailer is written when the encoder goes away
        drop(encoder);
        self.deliver(buffer.take());
        Ok(())
    }
}

struct ActiveSession {
    codec: RecordingCodec,
    commands: SyncSender<EncoderCommand>,
    worker: JoinHandle<Result<()>>,
    chunks: ChunkList,
    queued: Arc<AtomicUsize>,
    dropped: usize,
    clock: CaptureClock,
}

/// A stopped session whose encoder may still be draining its queue.
///
/// [`PendingRecording::wait`] blocks until the encoder has written the
/// trailer; run it off the render thread.
pub struct PendingRecording {
    codec: RecordingCodec,
    worker: JoinHandle<Result<()>>,
    chunks: ChunkList,
    dropped: usize,
    file_name: String,
}

impl PendingRecording {
    /// Joins the encoder and assembles the artifact. An encoder failure is
    /// an error: the stream would lack its trailer.
    pub fn wait(self) -> Result<RecordingArtifact> {
        match self.worker.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(DepthVideoError::Encode(
                    "recording encoder panicked".to_string(),
                ));
            }
        }

        let chunks =
            std::mem::take(&mut *self.chunks.lock().unwrap_or_else(PoisonError::into_inner));
        let chunk_lengths: Vec<usize> = chunks.iter().map(Vec::len).collect();
        let bytes = chunks.concat();

        info!(
            chunks = chunk_lengths.len(),
            bytes = bytes.len(),
            dropped = self.dropped,
            "recording finalized"
        );

        Ok(RecordingArtifact {
            bytes,
            chunk_lengths,
            dropped_frames: self.dropped,
            mime_type: self.codec.mime_type(),
            file_name: self.file_name,
        })
    }
}

enum SessionState {
    Inactive,
    Active(ActiveSession),
    Stopped,
}

pub struct RecordingSession {
    config: RecordingConfig,
    state: SessionState,
}

impl RecordingSession {
    pub fn new(config: RecordingConfig) -> Self {
        Self {
            config,
            state: SessionState::Inactive,
        }
    }

    pub fn config(&self) -> &RecordingConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Active(_))
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.state, SessionState::Stopped)
    }

    /// Starts the encoder. Fails with [`DepthVideoError::UnsupportedCodec`]
    /// when the configured mime type cannot be encoded; nothing is recorded
    /// in that case.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            SessionState::Active(_) => return Ok(()),
            SessionState::Stopped => {
                return Err(DepthVideoError::Encode(
                    "recording session already stopped".to_string(),
                ));
            }
            SessionState::Inactive => {}
        }

        let codec = RecordingCodec::from_mime(&self.config.mime_type)?;
        let chunks = ChunkList::default();
        let queued = Arc::new(AtomicUsize::new(0));
        let worker = EncoderWorker {
            codec,
            frame_rate: self.config.frame_rate,
            slice_interval: self.config.slice_interval,
            max_dimension: self.config.max_dimension,
            chunks: chunks.clone(),
            queued: queued.clone(),
        };

        // the extra slot keeps room for the stop command
        let (commands, receiver) = mpsc::sync_channel(self.config.queue_depth.max(1) + 1);
        let worker = thread::Builder::new()
            .name("recording-encoder".to_string())
            .spawn(move || worker.run(receiver))?;

        info!(
            mime = codec.mime_type(),
            fps = self.config.frame_rate,
            slice_ms = self.config.slice_interval.as_millis() as u64,
            "recording started"
        );

        self.state = SessionState::Active(ActiveSession {
            codec,
            commands,
            worker,
            chunks,
            queued,
            dropped: 0,
            clock: CaptureClock::new(self.config.frame_rate),
        });
        Ok(())
    }

    /// Whether a canvas sample should be taken at stream time `now`.
    pub fn capture_due(&mut self, now: Duration) -> bool {
        match &mut self.state {
            SessionState::Active(session) => session.clock.is_due(now),
            _ => false,
        }
    }

    /// Queues one rendered frame for encoding. Ignored unless active; when
    /// the encoder is behind, the frame is dropped.
    pub fn push_frame(&mut self, image: RgbaImage, timestamp: Duration) -> Result<()> {
        let queue_depth = self.config.queue_depth.max(1);
        let SessionState::Active(session) = &mut self.state else {
            return Ok(());
        };

        if session.queued.load(Ordering::Acquire) >= queue_depth {
            session.dropped += 1;
            debug!(dropped = session.dropped, "encoder busy, dropping capture");
            return Ok(());
        }

        session.queued.fetch_add(1, Ordering::AcqRel);
        match session
            .commands
            .try_send(EncoderCommand::Frame { image, timestamp })
        {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                session.queued.fetch_sub(1, Ordering::AcqRel);
                session.dropped += 1;
                debug!(dropped = session.dropped, "encoder busy, dropping capture");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => {
                session.queued.fetch_sub(1, Ordering::AcqRel);
                Err(DepthVideoError::Encode("recording encoder stopped".to_string()))
            }
        }
    }

    /// Frames handed to the encoder and not yet picked up.
    pub fn queued_frames(&self) -> usize {
        match &self.state {
            SessionState::Active(session) => session.queued.load(Ordering::Acquire),
            _ => 0,
        }
    }

    /// Captures dropped because the encoder was behind.
    pub fn dropped_frames(&self) -> usize {
        match &self.state {
            SessionState::Active(session) => session.dropped,
            _ => 0,
        }
    }

    /// Chunks delivered so far.
    pub fn chunk_count(&self) -> usize {
        match &self.state {
            SessionState::Active(session) => session
                .chunks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            _ => 0,
        }
    }

    /// Ends the session without waiting for the encoder. `None` unless a
    /// recording is active.
    pub fn finish(&mut self) -> Option<PendingRecording> {
        if !self.is_active() {
            debug!("no active recording to stop");
            return None;
        }
        let SessionState::Active(session) =
            std::mem::replace(&mut self.state, SessionState::Stopped)
        else {
            return None;
        };

        // a full queue means the worker is alive and draining; dropping the
        // sender ends its loop either way
        let _ = session.commands.try_send(EncoderCommand::Stop);
        drop(session.commands);
        info!(dropped = session.dropped, "recording stopped");

        Some(PendingRecording {
            codec: session.codec,
            worker: session.worker,
            chunks: session.chunks,
            dropped: session.dropped,
            file_name: format!("{}.{}", self.config.file_stem, session.codec.extension()),
        })
    }

    /// Ends the session and waits for the concatenated artifact. `Ok(None)`
    /// unless a recording is active.
    pub fn stop(&mut self) -> Result<Option<RecordingArtifact>> {
        self.finish().map(PendingRecording::wait).transpose()
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        // the encoder thread exits on its own once the queue drains
        drop(self.finish());
    }
}
