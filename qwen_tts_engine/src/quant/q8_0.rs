//! Q8_0: 32 values per block sharing one symmetric scale.
//!
//! `d = max(|x|) / 127`, `q = round(x / d)`. Rows whose length is not a
//! multiple of 32 are zero-padded in their final block.

use bytemuck::{Pod, Zeroable};

use super::dot::{dot_i8, dot_i8_scalar};
use super::pool::KernelPool;

pub const QK8_0: usize = 32;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct BlockQ8_0 {
    pub d: f32,
    pub qs: [i8; QK8_0],
}

const _: () = assert!(std::mem::size_of::<BlockQ8_0>() == 4 + QK8_0);

/// Number of blocks needed to hold `n` values.
#[inline]
pub fn blocks_for(n: usize) -> usize {
    n.div_ceil(QK8_0)
}

/// Quantize `x` into `out`, which must hold exactly `blocks_for(x.len())` blocks.
pub fn quantize_row(x: &[f32], out: &mut [BlockQ8_0]) {
    assert_eq!(out.len(), blocks_for(x.len()));
    for (block, chunk) in out.iter_mut().zip(x.chunks(QK8_0)) {
        let amax = chunk.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        let d = amax / 127.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };
        block.d = d;
        block.qs = [0; QK8_0];
        for (q, &v) in block.qs.iter_mut().zip(chunk) {
            *q = (v * id).round().clamp(-127.0, 127.0) as i8;
        }
    }
}

pub fn quantize(x: &[f32]) -> Vec<BlockQ8_0> {
    let mut out = vec![BlockQ8_0::zeroed(); blocks_for(x.len())];
    quantize_row(x, &mut out);
    out
}

/// Quantize a `[rows, cols]` matrix row by row.
pub fn quantize_matrix(weights: &[f32], rows: usize, cols: usize) -> Vec<BlockQ8_0> {
    assert_eq!(weights.len(), rows * cols);
    let bpr = blocks_for(cols);
    let mut out = vec![BlockQ8_0::zeroed(); rows * bpr];
    for (row, blocks) in weights.chunks(cols).zip(out.chunks_mut(bpr)) {
        quantize_row(row, blocks);
    }
    out
}

pub fn dequantize_row(blocks: &[BlockQ8_0], out: &mut [f32]) {
    for (chunk, block) in out.chunks_mut(QK8_0).zip(blocks) {
        for (o, &q) in chunk.iter_mut().zip(&block.qs) {
            *o = block.d * q as f32;
        }
    }
}

#[inline]
pub fn vec_dot(w: &[BlockQ8_0], x: &[BlockQ8_0]) -> f32 {
    w.iter()
        .zip(x)
        .map(|(bw, bx)| bw.d * bx.d * dot_i8(&bw.qs, &bx.qs) as f32)
        .sum()
}

#[inline]
pub fn vec_dot_scalar(w: &[BlockQ8_0], x: &[BlockQ8_0]) -> f32 {
    w.iter()
        .zip(x)
        .map(|(bw, bx)| bw.d * bx.d * dot_i8_scalar(&bw.qs, &bx.qs) as f32)
        .sum()
}

/// `out[r] = W[r] · x` for a row-major block matrix with `cols` logical columns.
pub fn matvec(pool: &KernelPool, out: &mut [f32], weights: &[BlockQ8_0], cols: usize, x: &[BlockQ8_0]) {
    let bpr = blocks_for(cols);
    debug_assert_eq!(x.len(), bpr);
    debug_assert_eq!(weights.len(), out.len() * bpr);
    pool.map_rows(out, |r| vec_dot(&weights[r * bpr..(r + 1) * bpr], x));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(n: usize, seed: u32) -> Vec<f32> {
        let mut s = seed.wrapping_mul(2654435761).wrapping_add(1);
        (0..n)
            .map(|_| {
                s ^= s << 13;
                s ^= s >> 17;
                s ^= s << 5;
                (s as f32 / u32::MAX as f32) * 2.0 - 1.0
            })
            .collect()
    }

    #[test]
    fn test_round_trip_error_bound() {
        let x = signal(1000, 3);
        let blocks = quantize(&x);
        let mut back = vec![0.0f32; x.len()];
        dequantize_row(&blocks, &mut back);
        for (b, (chunk, block)) in x.chunks(QK8_0).zip(&blocks).enumerate() {
            for (i, &v) in chunk.iter().enumerate() {
                // Half a quantization step at most.
                assert!((v - back[b * QK8_0 + i]).abs() <= block.d * 0.5 + 1e-6);
            }
        }
    }

    #[test]
    fn test_zero_block_has_zero_scale() {
        let blocks = quantize(&[0.0; 40]);
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|b| b.d == 0.0 && b.qs == [0; QK8_0]));
    }

    #[test]
    fn test_matvec_matches_f64_reference() {
        let pool = KernelPool::new(2).unwrap();
        for (rows, cols) in [(300, 64), (17, 100)] {
            let w = signal(rows * cols, 7);
            let x = signal(cols, 11);
            let wq = quantize_matrix(&w, rows, cols);
            let xq = quantize(&x);
            let mut out = vec![0.0f32; rows];
            matvec(&pool, &mut out, &wq, cols, &xq);

            let bpr = blocks_for(cols);
            let mut xd = vec![0.0f32; bpr * QK8_0];
            dequantize_row(&xq, &mut xd);
            for r in 0..rows {
                let mut wd = vec![0.0f32; bpr * QK8_0];
                dequantize_row(&wq[r * bpr..(r + 1) * bpr], &mut wd);
                let reference: f64 = wd.iter().zip(&xd).map(|(a, b)| *a as f64 * *b as f64).sum();
                assert!(
                    (out[r] as f64 - reference).abs() < 1e-4 * (1.0 + reference.abs()),
                    "row {r}: {} vs {reference}",
                    out[r]
                );
                assert_eq!(
                    vec_dot(&wq[r * bpr..(r + 1) * bpr], &xq),
                    vec_dot_scalar(&wq[r * bpr..(r + 1) * bpr], &xq)
                );
            }
        }
    }
}
