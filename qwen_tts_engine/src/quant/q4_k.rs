//! Q4_K super-block weights and the Q8_K activations they are multiplied with.
//!
//! A super-block covers 256 values as 8 sub-groups of 32. Each sub-group has
//! its own (scale, min) pair found by a weighted grid search, and those pairs
//! are re-quantized to 6 bits against two block-wide f16 factors:
//!
//! ```text
//! x ≈ d * scale[g] * q - dmin * min[g],   q ∈ [0, 15]
//! ```
//!
//! Layout and fitting procedure follow the k-quant scheme from ggml.

use bytemuck::{Pod, Zeroable};
use half::f16;

use super::dot::{dot_i8, dot_i8_scalar};
use super::pool::KernelPool;

pub const QK_K: usize = 256;
const K_SCALE_SIZE: usize = 12;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct BlockQ4K {
    /// Super-block scale for the quantized sub-scales.
    pub d: f16,
    /// Super-block scale for the quantized sub-mins.
    pub dmin: f16,
    /// Eight 6-bit scales and eight 6-bit mins, packed.
    pub scales: [u8; K_SCALE_SIZE],
    /// 4-bit quants; byte `l` of chunk `c` holds values `64c + l` (low) and `64c + 32 + l` (high).
    pub qs: [u8; QK_K / 2],
}

const _: () = assert!(std::mem::size_of::<BlockQ4K>() == 144);

/// Activation block: 256 int8 values with per-16 partial sums.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct BlockQ8K {
    pub d: f32,
    pub qs: [i8; QK_K],
    pub bsums: [i16; QK_K / 16],
}

#[inline]
pub fn blocks_for(n: usize) -> usize {
    n.div_ceil(QK_K)
}

/// Round half to even, matching the float trick used by the reference quantizer.
#[inline]
fn nearest_int(v: f32) -> i32 {
    v.round_ties_even() as i32
}

/// Unpack the 6-bit (scale, min) pair of sub-group `j`.
#[inline]
pub fn get_scale_min_k4(j: usize, q: &[u8; K_SCALE_SIZE]) -> (u8, u8) {
    if j < 4 {
        (q[j] & 63, q[j + 4] & 63)
    } else {
        (
            (q[j + 4] & 0xF) | ((q[j - 4] >> 6) << 4),
            (q[j + 4] >> 4) | ((q[j] >> 6) << 4),
        )
    }
}

/// Fit `x ≈ scale * L + min` with `L ∈ [0, nmax]`, minimizing weighted squared error.
///
/// Starts from the plain min/max fit and then scans `nstep + 1` candidate
/// inverse scales around it, re-solving the 2x2 least-squares system for each.
/// Returns `(scale, -min)`.
#[allow(clippy::too_many_arguments)]
fn make_qkx2_quants(
    x: &[f32],
    weights: &[f32],
    nmax: i32,
    l_out: &mut [u8],
    l_aux: &mut [u8],
    rmin: f32,
    rdelta: f32,
    nstep: i32,
) -> (f32, f32) {
    let n = x.len();
    let mut min = x[0];
    let mut max = x[0];
    let mut sum_w = weights[0];
    let mut sum_x = sum_w * x[0];
    for i in 1..n {
        min = min.min(x[i]);
        max = max.max(x[i]);
        sum_w += weights[i];
        sum_x += weights[i] * x[i];
    }
    if min > 0.0 {
        min = 0.0;
    }
    if max == min {
        l_out[..n].fill(0);
        return (0.0, -min);
    }

    let mut iscale = nmax as f32 / (max - min);
    let mut scale = 1.0 / iscale;
    let mut best_err = 0.0f32;
    for i in 0..n {
        let l = nearest_int(iscale * (x[i] - min)).clamp(0, nmax);
        l_out[i] = l as u8;
        let diff = scale * l as f32 + min - x[i];
        best_err += weights[i] * diff * diff;
    }

    for is in 0..=nstep {
        iscale = (rmin + rdelta * is as f32 + nmax as f32) / (max - min);
        let (mut sum_l, mut sum_l2, mut sum_xl) = (0.0f32, 0.0f32, 0.0f32);
        for i in 0..n {
            let l = nearest_int(iscale * (x[i] - min)).clamp(0, nmax);
            l_aux[i] = l as u8;
            let w = weights[i];
            let lf = l as f32;
            sum_l += w * lf;
            sum_l2 += w * lf * lf;
            sum_xl += w * lf * x[i];
        }
        let det = sum_w * sum_l2 - sum_l * sum_l;
        if det > 0.0 {
            let mut this_scale = (sum_w * sum_xl - sum_x * sum_l) / det;
            let mut this_min = (sum_l2 * sum_x - sum_l * sum_xl) / det;
            if this_min > 0.0 {
                this_min = 0.0;
                this_scale = sum_xl / sum_l2;
            }
            let mut err = 0.0f32;
            for i in 0..n {
                let diff = this_scale * l_aux[i] as f32 + this_min - x[i];
                err += weights[i] * diff * diff;
            }
            if err < best_err {
                l_out[..n].copy_from_slice(&l_aux[..n]);
                best_err = err;
                scale = this_scale;
                min = this_min;
            }
        }
    }
    (scale, -min)
}

/// Quantize one padded 256-value chunk.
fn quantize_block(x: &[f32; QK_K]) -> BlockQ4K {
    let mut block = BlockQ4K::zeroed();
    let mut l = [0u8; QK_K];
    let mut l_aux = [0u8; 32];
    let mut weights = [0.0f32; 32];
    let mut scales = [0.0f32; QK_K / 32];
    let mut mins = [0.0f32; QK_K / 32];

    let mut max_scale = 0.0f32;
    let mut max_min = 0.0f32;
    for j in 0..QK_K / 32 {
        let sub = &x[32 * j..32 * (j + 1)];
        let sum_x2: f32 = sub.iter().map(|v| v * v).sum();
        let av_x = (sum_x2 / 32.0).sqrt();
        for (w, v) in weights.iter_mut().zip(sub) {
            *w = av_x + v.abs();
        }
        let (scale, min) = make_qkx2_quants(
            sub,
            &weights,
            15,
            &mut l[32 * j..32 * (j + 1)],
            &mut l_aux,
            -1.0,
            0.1,
            20,
        );
        scales[j] = scale;
        mins[j] = min;
        max_scale = max_scale.max(scale);
        max_min = max_min.max(min);
    }

    let inv_scale = if max_scale > 0.0 { 63.0 / max_scale } else { 0.0 };
    let inv_min = if max_min > 0.0 { 63.0 / max_min } else { 0.0 };
    for j in 0..QK_K / 32 {
        let ls = nearest_int(inv_scale * scales[j]).clamp(0, 63) as u8;
        let lm = nearest_int(inv_min * mins[j]).clamp(0, 63) as u8;
        if j < 4 {
            block.scales[j] = ls;
            block.scales[j + 4] = lm;
        } else {
            block.scales[j + 4] = (ls & 0xF) | ((lm & 0xF) << 4);
            block.scales[j - 4] |= (ls >> 4) << 6;
            block.scales[j] |= (lm >> 4) << 6;
        }
    }
    block.d = f16::from_f32(max_scale / 63.0);
    block.dmin = f16::from_f32(max_min / 63.0);

    // Re-derive the quants against the rounded scales.
    for j in 0..QK_K / 32 {
        let (sc, m) = get_scale_min_k4(j, &block.scales);
        let d = block.d.to_f32() * sc as f32;
        if d == 0.0 {
            continue;
        }
        let dm = block.dmin.to_f32() * m as f32;
        for ii in 0..32 {
            l[32 * j + ii] = nearest_int((x[32 * j + ii] + dm) / d).clamp(0, 15) as u8;
        }
    }

    for c in 0..QK_K / 64 {
        for i in 0..32 {
            block.qs[32 * c + i] = l[64 * c + i] | (l[64 * c + 32 + i] << 4);
        }
    }
    block
}

/// Quantize a row of arbitrary length; the tail is zero-padded to 256.
pub fn quantize_row(x: &[f32], out: &mut [BlockQ4K]) {
    assert_eq!(out.len(), blocks_for(x.len()));
    let mut buf = [0.0f32; QK_K];
    for (block, chunk) in out.iter_mut().zip(x.chunks(QK_K)) {
        buf.fill(0.0);
        buf[..chunk.len()].copy_from_slice(chunk);
        *block = quantize_block(&buf);
    }
}

/// Quantize a row-major `[rows, cols]` matrix.
pub fn quantize_superblock_4bit(weights: &[f32], rows: usize, cols: usize) -> Vec<BlockQ4K> {
    assert_eq!(weights.len(), rows * cols);
    let bpr = blocks_for(cols);
    let mut out = vec![BlockQ4K::zeroed(); rows * bpr];
    for (row, blocks) in weights.chunks(cols).zip(out.chunks_mut(bpr)) {
        quantize_row(row, blocks);
    }
    out
}

pub fn dequantize_row(blocks: &[BlockQ4K], out: &mut [f32]) {
    let mut full = [0.0f32; QK_K];
    for (b, block) in blocks.iter().enumerate() {
        let d = block.d.to_f32();
        let dmin = block.dmin.to_f32();
        for c in 0..QK_K / 64 {
            let (sc0, m0) = get_scale_min_k4(2 * c, &block.scales);
            let (sc1, m1) = get_scale_min_k4(2 * c + 1, &block.scales);
            let (d0, dm0) = (d * sc0 as f32, dmin * m0 as f32);
            let (d1, dm1) = (d * sc1 as f32, dmin * m1 as f32);
            for i in 0..32 {
                let q = block.qs[32 * c + i];
                full[64 * c + i] = d0 * (q & 0xF) as f32 - dm0;
                full[64 * c + 32 + i] = d1 * (q >> 4) as f32 - dm1;
            }
        }
        let start = b * QK_K;
        if start >= out.len() {
            break;
        }
        let end = (start + QK_K).min(out.len());
        out[start..end].copy_from_slice(&full[..end - start]);
    }
}

/// Quantize an activation vector to Q8_K blocks (zero-padded tail).
pub fn quantize_row_q8k(x: &[f32]) -> Vec<BlockQ8K> {
    let mut out = vec![BlockQ8K::zeroed(); blocks_for(x.len())];
    let mut buf = [0.0f32; QK_K];
    for (block, chunk) in out.iter_mut().zip(x.chunks(QK_K)) {
        buf.fill(0.0);
        buf[..chunk.len()].copy_from_slice(chunk);

        let mut amax = 0.0f32;
        let mut max = 0.0f32;
        for &v in &buf {
            if v.abs() > amax {
                amax = v.abs();
                max = v;
            }
        }
        if amax == 0.0 {
            continue;
        }
        let iscale = -127.0 / max;
        for (q, &v) in block.qs.iter_mut().zip(&buf) {
            *q = nearest_int(iscale * v).min(127) as i8;
        }
        for (j, sum) in block.bsums.iter_mut().enumerate() {
            *sum = block.qs[16 * j..16 * (j + 1)]
                .iter()
                .map(|&q| q as i16)
                .sum();
        }
        block.d = 1.0 / iscale;
    }
    out
}

#[inline]
fn vec_dot_with(w: &[BlockQ4K], x: &[BlockQ8K], dot: fn(&[i8], &[i8]) -> i32) -> f32 {
    let mut lo = [0i8; 32];
    let mut hi = [0i8; 32];
    let mut sumf = 0.0f32;
    for (bw, bx) in w.iter().zip(x) {
        let mut sum_q = 0i32;
        let mut sum_m = 0i32;
        for c in 0..QK_K / 64 {
            let q = &bw.qs[32 * c..32 * (c + 1)];
            for i in 0..32 {
                lo[i] = (q[i] & 0xF) as i8;
                hi[i] = (q[i] >> 4) as i8;
            }
            let (sc0, m0) = get_scale_min_k4(2 * c, &bw.scales);
            let (sc1, m1) = get_scale_min_k4(2 * c + 1, &bw.scales);
            sum_q += sc0 as i32 * dot(&lo, &bx.qs[64 * c..64 * c + 32])
                + sc1 as i32 * dot(&hi, &bx.qs[64 * c + 32..64 * (c + 1)]);
            let s0 = bx.bsums[4 * c] as i32 + bx.bsums[4 * c + 1] as i32;
            let s1 = bx.bsums[4 * c + 2] as i32 + bx.bsums[4 * c + 3] as i32;
            sum_m += m0 as i32 * s0 + m1 as i32 * s1;
        }
        sumf += bw.d.to_f32() * bx.d * sum_q as f32 - bw.dmin.to_f32() * bx.d * sum_m as f32;
    }
    sumf
}

#[inline]
pub fn vec_dot(w: &[BlockQ4K], x: &[BlockQ8K]) -> f32 {
    vec_dot_with(w, x, dot_i8)
}

pub fn vec_dot_scalar(w: &[BlockQ4K], x: &[BlockQ8K]) -> f32 {
    vec_dot_with(w, x, dot_i8_scalar)
}

pub fn matvec(pool: &KernelPool, out: &mut [f32], weights: &[BlockQ4K], cols: usize, x: &[BlockQ8K]) {
    let bpr = blocks_for(cols);
    debug_assert_eq!(x.len(), bpr);
    debug_assert_eq!(weights.len(), out.len() * bpr);
    pool.map_rows(out, |r| vec_dot(&weights[r * bpr..(r + 1) * bpr], x));
}
