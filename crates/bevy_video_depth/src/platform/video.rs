//! Paced video playback decoded with FFmpeg on a background thread.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use bevy::log::{debug, info, warn};
use burn_video_depth::{DepthVideoError, Frame, FrameSource, Result};
use ffmpeg_next as ffmpeg;

#[derive(Default)]
struct Shared {
    latest: Mutex<Option<Frame>>,
    ended: AtomicBool,
    stop: AtomicBool,
}

/// Plays a video file in real time, exposing whatever frame is current.
pub struct VideoPlayback {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl VideoPlayback {
    /// Opens `path` and starts playback. Fails when the file cannot be
    /// opened or has no decodable video track.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let shared = Arc::new(Shared::default());
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("video-decoder".to_string())
                .spawn(move || {
                    let decoder = match VideoDecoder::new(&path) {
                        Ok(decoder) => {
                            let _ = ready_tx.send(Ok(()));
                            decoder
                        }
                        Err(err) => {
                            let _ = ready_tx.send(Err(err));
                            return;
                        }
                    };
                    if let Err(err) = decoder.play(&shared) {
                        warn!("video playback stopped early: {err}");
                    }
                    shared.ended.store(true, Ordering::Release);
                })?
        };

        ready_rx
            .recv()
            .map_err(|_| DepthVideoError::Decode("video decoder exited during open".to_string()))??;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }
}

impl FrameSource for VideoPlayback {
    fn latest_frame(&mut self) -> Option<Frame> {
        self.shared
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn has_ended(&self) -> bool {
        self.shared.ended.load(Ordering::Acquire)
    }
}

impl Drop for VideoPlayback {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

struct VideoDecoder {
    path: PathBuf,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    time_base: f64,
    frame_interval: Duration,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
}

fn decode_error(context: &str, err: ffmpeg::Error) -> DepthVideoError {
    DepthVideoError::Decode(format!("{context}: {err}"))
}

impl VideoDecoder {
    fn new(path: &Path) -> Result<Self> {
        ffmpeg::init().map_err(|err| decode_error("initialize ffmpeg", err))?;
        let input = ffmpeg::format::input(path)
            .map_err(|err| decode_error(&format!("open {}", path.display()), err))?;
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| DepthVideoError::Decode(format!("{} has no video track", path.display())))?;

        let stream_index = stream.index();
        let time_base = f64::from(stream.time_base());
        let frame_rate = f64::from(stream.avg_frame_rate());
        let frame_interval = if frame_rate.is_finite() && frame_rate > 0.0 {
            Duration::from_secs_f64(1.0 / frame_rate)
        } else {
            Duration::from_secs_f64(1.0 / 30.0)
        };

        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|err| decode_error("load video decoder parameters", err))?;
        let decoder = context
            .decoder()
            .video()
            .map_err(|err| decode_error("open video decoder", err))?;

        let scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::format::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .map_err(|err| decode_error("create scaler", err))?;

        info!(
            "opened {} ({}x{}, {:.2} fps)",
            path.display(),
            decoder.width(),
            decoder.height(),
            1.0 / frame_interval.as_secs_f64()
        );

        Ok(Self {
            path: path.to_path_buf(),
            input,
            stream_index,
            time_base,
            frame_interval,
            decoder,
            scaler,
        })
    }

    fn play(mut self, shared: &Shared) -> Result<()> {
        let started = Instant::now();
        let mut sequence = 0u64;
        let mut origin = None;
        let mut decoded = ffmpeg::frame::Video::empty();
        let mut rgb = ffmpeg::frame::Video::empty();

        let stream_index = self.stream_index;
        let mut packets = self.input.packets();
        loop {
            if shared.stop.load(Ordering::Acquire) {
                return Ok(());
            }

            let flushing = match packets.next() {
                Some((stream, packet)) => {
                    if stream.index() != stream_index {
                        continue;
                    }
                    self.decoder
                        .send_packet(&packet)
                        .map_err(|err| decode_error("send packet", err))?;
                    false
                }
                None => {
                    self.decoder
                        .send_eof()
                        .map_err(|err| decode_error("flush decoder", err))?;
                    true
                }
            };

            while self.decoder.receive_frame(&mut decoded).is_ok() {
                self.scaler
                    .run(&decoded, &mut rgb)
                    .map_err(|err| decode_error("scale frame to RGB", err))?;

                let presented = decoded
                    .timestamp()
                    .map(|ts| Duration::from_secs_f64((ts as f64 * self.time_base).max(0.0)))
                    .unwrap_or(self.frame_interval * sequence as u32);
                let timestamp = presented.saturating_sub(*origin.get_or_insert(presented));

                let frame = frame_from_video(&rgb, sequence, timestamp)?;

                if let Some(wait) = timestamp.checked_sub(started.elapsed()) {
                    thread::sleep(wait);
                }
                if shared.stop.load(Ordering::Acquire) {
                    return Ok(());
                }

                *shared.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
                sequence += 1;
            }

            if flushing {
                break;
            }
        }

        // the last frame stays on screen for its own duration
        thread::sleep(self.frame_interval);
        debug!("{} ended after {sequence} frames", self.path.display());
        Ok(())
    }
}

fn frame_from_video(frame: &ffmpeg::frame::Video, sequence: u64, timestamp: Duration) -> Result<Frame> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = width as usize * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let pixels = if stride == row_bytes {
        data.get(..row_bytes * height as usize)
            .ok_or_else(|| DepthVideoError::Decode("decoded frame is truncated".to_string()))?
            .to_vec()
    } else {
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            let line = data.get(start..start + row_bytes).ok_or_else(|| {
                DepthVideoError::Decode("decoded frame row is out of bounds".to_string())
            })?;
            pixels.extend_from_slice(line);
        }
        pixels
    };

    Frame::from_rgb(width, height, pixels, sequence, timestamp)
        .ok_or_else(|| DepthVideoError::Decode("decoded frame has inconsistent size".to_string()))
}
