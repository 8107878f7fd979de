//! Per-row symmetric int8 weights.
//!
//! `scale[r] = max(|row|) / 127`; values are rounded half away from zero and
//! clamped to `[-128, 127]`. The activation side uses the same scheme with a
//! single scale for the whole vector.

use super::dot::{dot_i8, dot_i8_scalar};
use super::pool::KernelPool;

#[inline]
fn quantize_into(values: &[f32], out: &mut [i8]) -> f32 {
    let amax = values.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    if amax == 0.0 {
        out.fill(0);
        return 0.0;
    }
    let inv = 127.0 / amax;
    for (q, &v) in out.iter_mut().zip(values) {
        *q = (v * inv).round().clamp(-128.0, 127.0) as i8;
    }
    amax / 127.0
}

/// Quantize a row-major `[rows, cols]` matrix. Returns `(data, scales)`.
pub fn quantize_per_row_int8(weights: &[f32], rows: usize, cols: usize) -> (Vec<i8>, Vec<f32>) {
    assert_eq!(weights.len(), rows * cols);
    let mut data = vec![0i8; rows * cols];
    let mut scales = vec![0.0f32; rows];
    if cols == 0 {
        return (data, scales);
    }
    for ((row, q), s) in weights
        .chunks(cols)
        .zip(data.chunks_mut(cols))
        .zip(scales.iter_mut())
    {
        *s = quantize_into(row, q);
    }
    (data, scales)
}

/// Quantize an activation vector with one shared scale.
pub fn quantize_activation(x: &[f32]) -> (Vec<i8>, f32) {
    let mut q = vec![0i8; x.len()];
    let scale = quantize_into(x, &mut q);
    (q, scale)
}

pub fn dequantize_row(data: &[i8], scale: f32, out: &mut [f32]) {
    for (o, &q) in out.iter_mut().zip(data) {
        *o = scale * q as f32;
    }
}

pub fn matvec(
    pool: &KernelPool,
    out: &mut [f32],
    data: &[i8],
    scales: &[f32],
    cols: usize,
    xq: &[i8],
    x_scale: f32,
) {
    debug_assert_eq!(xq.len(), cols);
    debug_assert_eq!(data.len(), out.len() * cols);
    pool.map_rows(out, |r| {
        scales[r] * x_scale * dot_i8(&data[r * cols..(r + 1) * cols], xq) as f32
    });
}

/// Single-threaded scalar path, kept as the reference for `matvec`.
pub fn matvec_scalar(out: &mut [f32], data: &[i8], scales: &[f32], cols: usize, xq: &[i8], x_scale: f32) {
    for (r, o) in out.iter_mut().enumerate() {
        *o = scales[r] * x_scale * dot_i8_scalar(&data[r * cols..(r + 1) * cols], xq) as f32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_scales_and_rounding() {
        let w = [1.0f32, -0.5, 0.25, 0.0, 2.0, 2.0, -2.0, 0.0];
        let (q, s) = quantize_per_row_int8(&w, 2, 4);
        assert_eq!(s, vec![1.0 / 127.0, 2.0 / 127.0]);
        // -0.5 * 127 = -63.5 rounds away from zero.
        assert_eq!(&q[..4], &[127, -64, 32, 0]);
        assert_eq!(&q[4..], &[127, 127, -127, 0]);
    }

    #[test]
    fn test_zero_row() {
        let (q, s) = quantize_per_row_int8(&[0.0; 6], 2, 3);
        assert_eq!(s, vec![0.0, 0.0]);
        assert!(q.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_round_trip_error_bound() {
        let (rows, cols) = (16, 200);
        let w: Vec<f32> = (0..rows * cols)
            .map(|i| ((i * 7919 % 1000) as f32 / 500.0 - 1.0) * (1 + i / cols) as f32)
            .collect();
        let (data, scales) = quantize_per_row_int8(&w, rows, cols);
        let mut back = vec![0.0f32; cols];
        let (mut err2, mut sig2) = (0.0f64, 0.0f64);
        for r in 0..rows {
            dequantize_row(&data[r * cols..(r + 1) * cols], scales[r], &mut back);
            for (&a, &b) in w[r * cols..(r + 1) * cols].iter().zip(&back) {
                // Half a quantization step at most.
                assert!((a - b).abs() <= scales[r] * 0.501);
                err2 += ((a - b) as f64).powi(2);
                sig2 += (a as f64).powi(2);
            }
        }
        // 255 levels: RMS error stays well under 1% of the signal.
        assert!((err2 / sig2).sqrt() < 0.01);
    }

    #[test]
    fn test_matvec_paths_agree_and_track_reference() {
        let pool = KernelPool::new(4).unwrap();
        for (rows, cols) in [(512, 96), (9, 33)] {
            let w: Vec<f32> = (0..rows * cols)
                .map(|i| ((i * 7919 % 1000) as f32 / 500.0) - 1.0)
                .collect();
            let x: Vec<f32> = (0..cols).map(|i| ((i * 31 % 17) as f32 / 8.0) - 1.0).collect();
            let (data, scales) = quantize_per_row_int8(&w, rows, cols);
            let (xq, xs) = quantize_activation(&x);

            let mut fast = vec![0.0f32; rows];
            let mut slow = vec![0.0f32; rows];
            matvec(&pool, &mut fast, &data, &scales, cols, &xq, xs);
            matvec_scalar(&mut slow, &data, &scales, cols, &xq, xs);
            assert_eq!(fast, slow);

            for r in 0..rows {
                let reference: f64 = (0..cols)
                    .map(|c| (scales[r] * data[r * cols + c] as f32) as f64 * (xs * xq[c] as f32) as f64)
                    .sum();
                assert!((fast[r] as f64 - reference).abs() < 1e-4 * (1.0 + reference.abs()));
            }
        }
    }
}
