#![recursion_limit = "256"]

use std::hint::black_box;

use burn::prelude::*;
use burn_video_depth::{
    DepthPipeline, DepthPipelineConfig, Frame, InferenceBackend, InterpolationMethod,
    PyDNetConfig, pipeline::resize_bilinear,
};
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use image::{Rgb, RgbImage};

criterion_group! {
    name = pipeline_benchmarks;
    config = Criterion::default().sample_size(10);
    targets = resize_benchmark, pipeline_benchmark,
}
criterion_main!(pipeline_benchmarks);

fn resize_benchmark(c: &mut Criterion) {
    let device = <InferenceBackend as Backend>::Device::default();

    let cases = [
        ("c3_720x1280_to_384x640", [720, 1280]),
        ("c3_1080x1920_to_384x640", [1080, 1920]),
        ("c3_240x320_to_384x640", [240, 320]),
    ];

    let mut group = c.benchmark_group("video_depth_resize");
    group.throughput(Throughput::Elements((3 * 384 * 640) as u64));
    for (name, [height, width]) in cases {
        let input: Tensor<InferenceBackend, 4> = Tensor::zeros([1, 3, height, width], &device);

        for method in [InterpolationMethod::Legacy, InterpolationMethod::Burn] {
            group.bench_function(format!("{name}::{method:?}"), |b| {
                b.iter(|| {
                    let output = resize_bilinear(input.clone(), [384, 640], method).ok();
                    InferenceBackend::sync(&device);
                    black_box(output);
                });
            });
        }
    }
    group.finish();
}

fn pipeline_benchmark(c: &mut Criterion) {
    let device = <InferenceBackend as Backend>::Device::default();
    let model = PyDNetConfig::new().init::<InferenceBackend>(&device);
    let pipeline = DepthPipeline::new(model, device, DepthPipelineConfig::new());

    let frame = Frame::still(RgbImage::from_fn(1280, 720, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    }));

    let mut group = c.benchmark_group("video_depth_pipeline");
    group.throughput(Throughput::Elements(1));
    group.bench_function("pydnet_720p_frame", |b| {
        b.iter(|| {
            let depth = pipeline.infer_blocking(&frame);
            black_box(depth).ok();
        });
    });
    group.finish();
}
