use burn::{
    config::Config,
    tensor::{
        Tensor,
        backend::Backend,
        module,
        ops::{InterpolateMode, InterpolateOptions},
    },
};

use crate::error::{DepthVideoError, Result};

#[derive(Config, Debug, Copy, PartialEq, Eq)]
pub enum InterpolationMethod {
    /// Host-side bilinear on the legacy sampling grid: `src = dst * in / out`,
    /// no half-pixel offset, edges clamped.
    Legacy,
    /// burn's built-in bilinear interpolate (corner aligned).
    Burn,
}

impl Default for InterpolationMethod {
    fn default() -> Self {
        Self::Legacy
    }
}

fn bilinear_sample(input: &[f32], in_width: usize, in_height: usize, x: f32, y: f32) -> f32 {
    let x0 = x.floor().max(0.0);
    let y0 = y.floor().max(0.0);
    let x1 = (x0 + 1.0).min((in_width - 1) as f32);
    let y1 = (y0 + 1.0).min((in_height - 1) as f32);

    let x0_idx = x0 as usize;
    let y0_idx = y0 as usize;
    let x1_idx = x1 as usize;
    let y1_idx = y1 as usize;

    let dx = x - x0;
    let dy = y - y0;

    let top = input[y0_idx * in_width + x0_idx] * (1.0 - dx) + input[y0_idx * in_width + x1_idx] * dx;
    let bottom =
        input[y1_idx * in_width + x0_idx] * (1.0 - dx) + input[y1_idx * in_width + x1_idx] * dx;

    top * (1.0 - dy) + bottom * dy
}

/// Resamples contiguous `[batch * channels]` planes of `in_size` onto the
/// legacy grid.
fn resample_planes(
    values: &[f32],
    planes: usize,
    in_size: [usize; 2],
    out_size: [usize; 2],
) -> Result<Vec<f32>> {
    let [in_height, in_width] = in_size;
    let [out_height, out_width] = out_size;
    let plane = in_height * in_width;

    if plane == 0 || out_height * out_width == 0 {
        return Err(DepthVideoError::ModelInference(format!(
            "cannot resize {in_width}x{in_height} to {out_width}x{out_height}"
        )));
    }
    if values.len() != planes * plane {
        return Err(DepthVideoError::ModelInference(format!(
            "resize read back {} values, expected {}",
            values.len(),
            planes * plane
        )));
    }

    let scale_y = in_height as f32 / out_height as f32;
    let scale_x = in_width as f32 / out_width as f32;
    let mut output = Vec::with_capacity(planes * out_height * out_width);

    for source in values.chunks_exact(plane) {
        for oy in 0..out_height {
            let in_y = oy as f32 * scale_y;
            for ox in 0..out_width {
                let in_x = ox as f32 * scale_x;
                output.push(bilinear_sample(source, in_width, in_height, in_x, in_y));
            }
        }
    }

    Ok(output)
}

fn resize_bilinear_legacy<B: Backend>(
    input: Tensor<B, 4>,
    output_size: [usize; 2],
) -> Result<Tensor<B, 4>> {
    let [batch, channels, in_height, in_width] = input.shape().dims::<4>();
    let [out_height, out_width] = output_size;

    let device = input.device();
    let input_values = input
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| {
            DepthVideoError::ModelInference(format!("resize readback failed: {err:?}"))
        })?;

    let output = resample_planes(
        &input_values,
        batch * channels,
        [in_height, in_width],
        output_size,
    )?;

    Ok(Tensor::<B, 1>::from_floats(output.as_slice(), &device).reshape([
        batch as i32,
        channels as i32,
        out_height as i32,
        out_width as i32,
    ]))
}

/// Resamples an `NCHW` tensor to `output_size` (`[height, width]`).
///
/// Empty planes and failed host readbacks are
/// [`DepthVideoError::ModelInference`] errors.
pub fn resize_bilinear<B: Backend>(
    input: Tensor<B, 4>,
    output_size: [usize; 2],
    method: InterpolationMethod,
) -> Result<Tensor<B, 4>> {
    let [_, _, in_height, in_width] = input.shape().dims::<4>();
    if [in_height, in_width] == output_size {
        return Ok(input);
    }

    match method {
        InterpolationMethod::Legacy => resize_bilinear_legacy(input, output_size),
        InterpolationMethod::Burn => {
            if in_height * in_width == 0 || output_size.contains(&0) {
                return Err(DepthVideoError::ModelInference(format!(
                    "cannot resize {in_width}x{in_height} to {}x{}",
                    output_size[1], output_size[0]
                )));
            }
            Ok(module::interpolate(
                input,
                output_size,
                InterpolateOptions::new(InterpolateMode::Bilinear),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestBackend = burn::backend::NdArray<f32>;

    fn tensor_from_values(
        device: &<TestBackend as Backend>::Device,
        values: &[f32],
        shape: [usize; 4],
    ) -> Tensor<TestBackend, 4> {
        Tensor::<TestBackend, 1>::from_floats(values, device).reshape([
            shape[0] as i32,
            shape[1] as i32,
            shape[2] as i32,
            shape[3] as i32,
        ])
    }

    #[test]
    fn legacy_grid_upsamples_without_half_pixel_offset() {
        let device = Default::default();
        let input = tensor_from_values(&device, &[1.0, 2.0, 3.0, 4.0], [1, 1, 2, 2]);

        let output = resize_bilinear(input, [4, 4], InterpolationMethod::Legacy).unwrap();

        let expected = tensor_from_values(
            &device,
            &[
                1.0, 1.5, 2.0, 2.0, //
                2.0, 2.5, 3.0, 3.0, //
                3.0, 3.5, 4.0, 4.0, //
                3.0, 3.5, 4.0, 4.0,
            ],
            [1, 1, 4, 4],
        );
        assert!(
            output.clone().all_close(expected, Some(1e-5), Some(1e-5)),
            "legacy interpolation output {output:?} did not match expected values"
        );
    }

    #[test]
    fn legacy_grid_downsamples_by_picking_grid_points() {
        let device = Default::default();
        let values: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let input = tensor_from_values(&device, &values, [1, 1, 4, 4]);

        let output = resize_bilinear(input, [2, 2], InterpolationMethod::Legacy).unwrap();

        let expected = tensor_from_values(&device, &[0.0, 2.0, 8.0, 10.0], [1, 1, 2, 2]);
        assert!(output.all_close(expected, Some(1e-5), Some(1e-5)));
    }

    #[test]
    fn channels_are_resized_independently() {
        let device = Default::default();
        let input = tensor_from_values(&device, &[0.0, 0.0, 10.0, 10.0], [1, 2, 1, 2]);

        let output = resize_bilinear(input, [2, 4], InterpolationMethod::Burn).unwrap();

        let data = output.into_data().to_vec::<f32>().unwrap();
        assert_eq!(data.len(), 16);
        assert!(data[..8].iter().all(|v| v.abs() < 1e-6));
        assert!(data[8..].iter().all(|v| (v - 10.0).abs() < 1e-5));
    }

    #[test]
    fn matching_size_is_passthrough() {
        let device = Default::default();
        let input = tensor_from_values(&device, &[5.0, 6.0], [1, 1, 1, 2]);
        let output = resize_bilinear(input.clone(), [1, 2], InterpolationMethod::Legacy).unwrap();
        assert!(output.all_close(input, None, None));
    }

    #[test]
    fn short_readback_is_an_inference_error() {
        // one plane of 2x2 expected, three values present
        let result = resample_planes(&[1.0, 2.0, 3.0], 1, [2, 2], [4, 4]);
        assert!(matches!(result, Err(DepthVideoError::ModelInference(_))));

        let planes = resample_planes(&[1.0, 2.0, 3.0, 4.0], 1, [2, 2], [1, 1]).unwrap();
        assert_eq!(planes, vec![1.0]);
    }

    #[test]
    fn empty_planes_are_rejected_by_both_methods() {
        let device = Default::default();
        for method in [InterpolationMethod::Legacy, InterpolationMethod::Burn] {
            let input: Tensor<TestBackend, 4> = Tensor::zeros([1, 3, 0, 4], &device);
            assert!(matches!(
                resize_bilinear(input, [2, 2], method),
                Err(DepthVideoError::ModelInference(_))
            ));

            let input: Tensor<TestBackend, 4> = Tensor::zeros([1, 3, 2, 2], &device);
            assert!(resize_bilinear(input, [0, 2], method).is_err());
        }
    }
}
