#![recursion_limit = "256"]

use std::path::{Path, PathBuf};

use burn::prelude::*;
use burn_video_depth::{
    CompositeRenderer, DepthPipeline, DepthPipelineConfig, DrawingBuffer, Frame, InferenceBackend,
    PyDNet, PyDNetConfig, RenderBridge, composite::SoftwareCompositor, model::DEFAULT_CHECKPOINT,
};

/// Usage: `depth_image [image] [checkpoint]`. Writes `depth.png` (grayscale)
/// and `composite.png` (side-by-side quad) next to the input image.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let image_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("assets/image/test.jpg"));
    let checkpoint = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CHECKPOINT));

    let device = <InferenceBackend as Backend>::Device::default();
    let model = PyDNet::<InferenceBackend>::load(&device, PyDNetConfig::new(), &checkpoint)?;
    let pipeline = DepthPipeline::new(model, device, DepthPipelineConfig::new());

    let image = image::open(&image_path)
        .map_err(|err| format!("failed to load image `{}`: {err}", image_path.display()))?
        .to_rgb8();
    let frame = Frame::still(image);
    let depth = pipeline.infer_blocking(&frame)?;

    let output_dir = image_path.parent().unwrap_or(Path::new("."));
    let depth_path = output_dir.join("depth.png");
    depth
        .to_luma8()
        .ok_or("depth field has no pixels")?
        .save(&depth_path)?;

    let bridge = RenderBridge::new();
    bridge.set_color_source(frame);
    bridge.set_depth_field(depth);

    let mut compositor = SoftwareCompositor::new(DrawingBuffer {
        width: 1280,
        height: 640,
    });
    compositor.render(&bridge.snapshot(), true);
    let composite_path = output_dir.join("composite.png");
    compositor.canvas().save(&composite_path)?;

    println!(
        "wrote {} and {}",
        depth_path.display(),
        composite_path.display()
    );
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
