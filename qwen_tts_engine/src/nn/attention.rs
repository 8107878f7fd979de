//! Grouped-query causal attention over a KV cache, with optional sliding window.

use crate::quant::dot::dot_f32;

/// Head layout of one attention block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionShape {
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    /// Attend only to the trailing `window` positions (inclusive of the query).
    pub window: Option<usize>,
}

impl AttentionShape {
    pub fn q_dim(&self) -> usize {
        self.num_heads * self.head_dim
    }

    pub fn kv_dim(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }

    /// Query heads sharing one key/value head.
    pub fn groups(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    /// First cached position visible to a query at `pos`.
    pub fn window_start(&self, pos: usize) -> usize {
        match self.window {
            Some(w) => (pos + 1).saturating_sub(w),
            None => 0,
        }
    }
}

/// Numerically stable in-place softmax.
pub fn softmax(x: &mut [f32]) {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    let inv = 1.0 / sum;
    for v in x.iter_mut() {
        *v *= inv;
    }
}

/// Attention output for one query token at cache position `pos`.
///
/// `keys`/`values` hold positions `[0, pos]` packed as `[pos + 1, kv_dim]`.
/// `scores` is caller-owned scratch and is resized as needed.
pub fn attend(
    out: &mut [f32],
    q: &[f32],
    keys: &[f32],
    values: &[f32],
    pos: usize,
    shape: &AttentionShape,
    scores: &mut Vec<f32>,
) {
    let hd = shape.head_dim;
    let kv_dim = shape.kv_dim();
    let groups = shape.groups();
    let start = shape.window_start(pos);
    let n = pos + 1 - start;
    debug_assert!(keys.len() >= (pos + 1) * kv_dim);
    let scale = 1.0 / (hd as f32).sqrt();
    scores.resize(n, 0.0);

    for h in 0..shape.num_heads {
        let kvh = h / groups;
        let qh = &q[h * hd..(h + 1) * hd];
        for (i, t) in (start..=pos).enumerate() {
            let k = &keys[t * kv_dim + kvh * hd..t * kv_dim + (kvh + 1) * hd];
            scores[i] = dot_f32(qh, k) * scale;
        }
        softmax(&mut scores[..n]);

        let oh = &mut out[h * hd..(h + 1) * hd];
        oh.fill(0.0);
        for (i, t) in (start..=pos).enumerate() {
            let w = scores[i];
            let v = &values[t * kv_dim + kvh * hd..t * kv_dim + (kvh + 1) * hd];
            for (o, &vv) in oh.iter_mut().zip(v) {
                *o += w * vv;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_softmax_is_shift_invariant() {
        let mut a = [1.0f32, 2.0, 3.0];
        let mut b = [1001.0f32, 1002.0, 1003.0];
        softmax(&mut a);
        softmax(&mut b);
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6);
        }
        assert!((a.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_single_position_returns_its_value() {
        let shape = AttentionShape {
            num_heads: 4,
            num_kv_heads: 2,
            head_dim: 2,
            window: None,
        };
        let q = [0.3f32; 8];
        let keys = [1.0f32, 0.0, 0.0, 1.0];
        let values = [5.0f32, 6.0, 7.0, 8.0];
        let mut out = [0.0f32; 8];
        let mut scores = Vec::new();
        attend(&mut out, &q, &keys, &values, 0, &shape, &mut scores);
        // Heads 0 and 1 read kv-head 0, heads 2 and 3 read kv-head 1.
        assert_eq!(out, [5.0, 6.0, 5.0, 6.0, 7.0, 8.0, 7.0, 8.0]);
    }

    #[test]
    fn test_window_hides_old_positions() {
        let shape = AttentionShape {
            num_heads: 1,
            num_kv_heads: 1,
            head_dim: 1,
            window: Some(2),
        };
        assert_eq!(shape.window_start(0), 0);
        assert_eq!(shape.window_start(5), 4);
        // Zero query: uniform weights over the visible window only.
        let keys = [1.0f32, 1.0, 1.0, 1.0];
        let values = [100.0f32, 100.0, 2.0, 4.0];
        let mut out = [0.0f32; 1];
        let mut scores = Vec::new();
        attend(&mut out, &[0.0], &keys, &values, 3, &shape, &mut scores);
        assert!((out[0] - 3.0).abs() < 1e-6);
    }
}
