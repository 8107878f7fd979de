//! One pre-norm transformer decoder layer.
//!
//! A single function serves the talker, the code predictor and the codec
//! transformer. They differ only in head counts, the sliding window, the
//! presence of per-head QK norms and the presence of layer scales.

use crate::nn::attention::{AttentionShape, attend};
use crate::nn::kv_cache::KVCache;
use crate::nn::mlp::{add_inplace, mul_inplace, swiglu};
use crate::nn::norm::{rms_norm, rms_norm_heads};
use crate::nn::rope::{RopeTable, apply_rope};
use crate::quant::{KernelPool, QuantMatrix};

/// Weights of one decoder layer.
#[derive(Debug, Clone)]
pub struct LayerWeights {
    pub input_norm: Vec<f32>,
    pub post_attention_norm: Vec<f32>,
    /// Per-head RMS weights `[head_dim]`, absent for the codec transformer
    pub q_norm: Option<Vec<f32>>,
    pub k_norm: Option<Vec<f32>>,
    /// Fused `[q_dim + 2 * kv_dim, hidden]`
    pub wqkv: QuantMatrix,
    /// `[hidden, q_dim]`
    pub wo: QuantMatrix,
    /// Fused `[2 * intermediate, hidden]`, gate rows first
    pub gate_up: QuantMatrix,
    /// `[hidden, intermediate]`
    pub down: QuantMatrix,
    /// Per-channel residual scales (codec transformer only)
    pub attn_layer_scale: Option<Vec<f32>>,
    pub mlp_layer_scale: Option<Vec<f32>>,
}

/// Reusable buffers for [`forward_layer`], grown on demand.
#[derive(Debug, Clone, Default)]
pub struct LayerScratch {
    x_norm: Vec<f32>,
    qkv: Vec<f32>,
    q_all: Vec<f32>,
    attn: Vec<f32>,
    proj: Vec<f32>,
    gate_up: Vec<f32>,
    act: Vec<f32>,
    scores: Vec<f32>,
}

/// Static dimensions shared by every layer of a stack.
#[derive(Debug, Clone, Copy)]
pub struct LayerDims {
    pub hidden: usize,
    pub intermediate: usize,
    pub attention: AttentionShape,
    pub eps: f32,
}

/// Run `layer` over `n` tokens packed in `hidden = [n, dims.hidden]`.
///
/// Token `t` sits at cache position `start_pos + t`. K/V for all `n`
/// positions are written before any token attends, and causality comes from
/// each query reading only up to its own position. The cache must already
/// have room for `start_pos + n` positions and `rope` must cover them.
#[allow(clippy::too_many_arguments)]
pub fn forward_layer(
    layer: &LayerWeights,
    dims: &LayerDims,
    layer_idx: usize,
    hidden: &mut [f32],
    start_pos: usize,
    rope: &RopeTable,
    cache: &mut KVCache,
    pool: &KernelPool,
    scratch: &mut LayerScratch,
) {
    let shape = &dims.attention;
    let h = dims.hidden;
    let n = hidden.len() / h;
    let q_dim = shape.q_dim();
    let kv_dim = shape.kv_dim();
    let hd = shape.head_dim;

    scratch.x_norm.resize(h, 0.0);
    scratch.qkv.resize(q_dim + 2 * kv_dim, 0.0);
    scratch.q_all.resize(n * q_dim, 0.0);
    scratch.attn.resize(q_dim, 0.0);
    scratch.proj.resize(h, 0.0);
    scratch.gate_up.resize(2 * dims.intermediate, 0.0);
    scratch.act.resize(dims.intermediate, 0.0);

    // Projections, norms, rotary and cache writes for every token.
    for t in 0..n {
        let pos = start_pos + t;
        rms_norm(&mut scratch.x_norm, &hidden[t * h..(t + 1) * h], &layer.input_norm, dims.eps);
        layer.wqkv.matvec(pool, &scratch.x_norm, &mut scratch.qkv);

        let (q, kv) = scratch.qkv.split_at_mut(q_dim);
        let (k, v) = kv.split_at_mut(kv_dim);
        if let Some(w) = &layer.q_norm {
            rms_norm_heads(q, w, hd, dims.eps);
        }
        if let Some(w) = &layer.k_norm {
            rms_norm_heads(k, w, hd, dims.eps);
        }
        let (cos, sin) = rope.row(pos);
        apply_rope(q, hd, cos, sin);
        apply_rope(k, hd, cos, sin);

        cache.write(layer_idx, pos, k, v);
        scratch.q_all[t * q_dim..(t + 1) * q_dim].copy_from_slice(q);
    }

    let last_pos = start_pos + n;
    for t in 0..n {
        let pos = start_pos + t;
        let x = &mut hidden[t * h..(t + 1) * h];

        attend(
            &mut scratch.attn,
            &scratch.q_all[t * q_dim..(t + 1) * q_dim],
            cache.keys(layer_idx, last_pos),
            cache.values(layer_idx, last_pos),
            pos,
            shape,
            &mut scratch.scores,
        );
        layer.wo.matvec(pool, &scratch.attn, &mut scratch.proj);
        if let Some(scale) = &layer.attn_layer_scale {
            mul_inplace(&mut scratch.proj, scale);
        }
        add_inplace(x, &scratch.proj);

        rms_norm(&mut scratch.x_norm, x, &layer.post_attention_norm, dims.eps);
        layer.gate_up.matvec(pool, &scratch.x_norm, &mut scratch.gate_up);
        swiglu(&scratch.gate_up, &mut scratch.act);
        layer.down.matvec(pool, &scratch.act, &mut scratch.proj);
        if let Some(scale) = &layer.mlp_layer_scale {
            mul_inplace(&mut scratch.proj, scale);
        }
        add_inplace(x, &scratch.proj);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quant::Encoding;

    fn matrix(rows: usize, cols: usize, seed: usize) -> QuantMatrix {
        let w = (0..rows * cols)
            .map(|i| ((((i + seed) * 7919) % 97) as f32 / 97.0 - 0.5) * 0.2)
            .collect();
        QuantMatrix::from_f32(w, rows, cols, Encoding::F32)
    }

    fn layer(dims: &LayerDims, qk_norm: bool) -> LayerWeights {
        let s = &dims.attention;
        let hd = s.head_dim;
        LayerWeights {
            input_norm: vec![1.0; dims.hidden],
            post_attention_norm: vec![1.0; dims.hidden],
            q_norm: qk_norm.then(|| vec![1.0; hd]),
            k_norm: qk_norm.then(|| vec![1.0; hd]),
            wqkv: matrix(s.q_dim() + 2 * s.kv_dim(), dims.hidden, 1),
            wo: matrix(dims.hidden, s.q_dim(), 2),
            gate_up: matrix(2 * dims.intermediate, dims.hidden, 3),
            down: matrix(dims.hidden, dims.intermediate, 4),
            attn_layer_scale: None,
            mlp_layer_scale: None,
        }
    }

    fn dims(window: Option<usize>) -> LayerDims {
        LayerDims {
            hidden: 16,
            intermediate: 24,
            attention: AttentionShape {
                num_heads: 4,
                num_kv_heads: 2,
                head_dim: 8,
                window,
            },
            eps: 1e-6,
        }
    }

    /// Processing a sequence in one call or token by token gives the same result.
    #[test]
    fn test_batched_equals_incremental() {
        for (window, qk_norm) in [(None, true), (Some(3), false)] {
            let d = dims(window);
            let w = layer(&d, qk_norm);
            let pool = KernelPool::inline();
            let mut rope = RopeTable::new(8, 10000.0);
            rope.ensure(6);
            let input: Vec<f32> = (0..6 * 16).map(|i| ((i * 13) % 11) as f32 / 11.0 - 0.5).collect();

            let mut batched = input.clone();
            let mut cache = KVCache::with_num_layers(1, d.attention.kv_dim(), 6, 0);
            let mut scratch = LayerScratch::default();
            forward_layer(&w, &d, 0, &mut batched, 0, &rope, &mut cache, &pool, &mut scratch);

            let mut stepped = input.clone();
            let mut cache2 = KVCache::with_num_layers(1, d.attention.kv_dim(), 6, 0);
            for t in 0..6 {
                forward_layer(&w, &d, 0, &mut stepped[t * 16..(t + 1) * 16], t, &rope, &mut cache2, &pool, &mut scratch);
                cache2.commit(t + 1);
            }
            for (a, b) in batched.iter().zip(&stepped) {
                assert!((a - b).abs() < 1e-5, "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_layer_scales_apply_to_residual_branches() {
        let d = dims(None);
        let mut w = layer(&d, false);
        w.attn_layer_scale = Some(vec![0.0; 16]);
        w.mlp_layer_scale = Some(vec![0.0; 16]);
        let pool = KernelPool::inline();
        let mut rope = RopeTable::new(8, 10000.0);
        rope.ensure(1);
        let mut cache = KVCache::with_num_layers(1, d.attention.kv_dim(), 1, 0);
        let input: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let mut x = input.clone();
        forward_layer(&w, &d, 0, &mut x, 0, &rope, &mut cache, &pool, &mut LayerScratch::default());
        assert_eq!(x, input);
    }
}
