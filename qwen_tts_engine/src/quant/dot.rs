//! Integer dot products shared by every quantized kernel.
//!
//! `dot_i8` picks the fastest path for the target; `dot_i8_scalar` is the
//! reference. Integer accumulation makes all paths bit-identical.

/// Accelerated i8·i8 dot product.
#[inline]
pub fn dot_i8(a: &[i8], b: &[i8]) -> i32 {
    debug_assert_eq!(a.len(), b.len());
    #[cfg(target_arch = "aarch64")]
    {
        dot_i8_neon(a, b)
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        dot_i8_unrolled(a, b)
    }
}

/// Plain element-by-element reference.
#[inline]
pub fn dot_i8_scalar(a: &[i8], b: &[i8]) -> i32 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| x as i32 * y as i32)
        .sum()
}

/// Eight independent lanes; the shape the autovectorizer turns into SIMD.
#[inline]
pub fn dot_i8_unrolled(a: &[i8], b: &[i8]) -> i32 {
    let mut lanes = [0i32; 8];
    let ca = a.chunks_exact(8);
    let cb = b.chunks_exact(8);
    let tail = dot_i8_scalar(ca.remainder(), cb.remainder());
    for (x, y) in ca.zip(cb) {
        for l in 0..8 {
            lanes[l] += x[l] as i32 * y[l] as i32;
        }
    }
    lanes.iter().sum::<i32>() + tail
}

#[cfg(target_arch = "aarch64")]
#[inline]
fn dot_i8_neon(a: &[i8], b: &[i8]) -> i32 {
    use std::arch::aarch64::*;

    let n = a.len().min(b.len());
    let chunks = n / 16;
    // SAFETY: NEON is baseline on aarch64 and every load reads 16 bytes that
    // lie inside the first `chunks * 16` elements of both slices.
    let head = unsafe {
        let mut acc = vdupq_n_s32(0);
        for c in 0..chunks {
            let va = vld1q_s8(a.as_ptr().add(c * 16));
            let vb = vld1q_s8(b.as_ptr().add(c * 16));
            let lo = vmull_s8(vget_low_s8(va), vget_low_s8(vb));
            let hi = vmull_high_s8(va, vb);
            acc = vpadalq_s16(acc, lo);
            acc = vpadalq_s16(acc, hi);
        }
        vaddvq_s32(acc)
    };
    head + dot_i8_scalar(&a[chunks * 16..n], &b[chunks * 16..n])
}

/// f32 dot product with four partial sums.
#[inline]
pub fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut acc = [0.0f32; 4];
    let ca = a.chunks_exact(4);
    let cb = b.chunks_exact(4);
    let tail: f32 = ca
        .remainder()
        .iter()
        .zip(cb.remainder())
        .map(|(x, y)| x * y)
        .sum();
    for (x, y) in ca.zip(cb) {
        for l in 0..4 {
            acc[l] += x[l] * y[l];
        }
    }
    (acc[0] + acc[1]) + (acc[2] + acc[3]) + tail
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(n: usize, seed: i32) -> Vec<i8> {
        (0..n as i32)
            .map(|i| ((i * 37 + seed * 11) % 255 - 127) as i8)
            .collect()
    }

    #[test]
    fn test_accelerated_matches_scalar() {
        for n in [0, 1, 7, 16, 31, 32, 100, 256, 1000] {
            let a = pattern(n, 1);
            let b = pattern(n, 5);
            assert_eq!(dot_i8(&a, &b), dot_i8_scalar(&a, &b), "n = {n}");
            assert_eq!(dot_i8_unrolled(&a, &b), dot_i8_scalar(&a, &b), "n = {n}");
        }
    }

    #[test]
    fn test_extremes_do_not_overflow_lanes() {
        let a = vec![-128i8; 256];
        let b = vec![-128i8; 256];
        assert_eq!(dot_i8(&a, &b), 256 * 16384);
    }

    #[test]
    fn test_dot_f32() {
        let a: Vec<f32> = (0..11).map(|i| i as f32).collect();
        let b = vec![2.0f32; 11];
        assert_eq!(dot_f32(&a, &b), 110.0);
    }
}
