//! ConvNeXt blocks for the codec upsampling stages.

use crate::audio::tokenizer::v2::causal_conv::CausalConv1d;
use crate::error::LoadError;
use crate::io::WeightStore;
use crate::nn::mlp::gelu_inplace;
use crate::nn::norm::layer_norm;
use crate::quant::{Encoding, KernelPool, QuantMatrix};

const LAYER_NORM_EPS: f32 = 1e-6;
const DWCONV_KERNEL: usize = 7;

/// ConvNeXt block with a causal depthwise convolution.
///
/// Architecture:
/// - Depthwise causal conv (kernel=7)
/// - LayerNorm
/// - Pointwise expansion (4x)
/// - GELU activation
/// - Pointwise projection
/// - Learnable scale (gamma)
/// - Residual connection
#[derive(Debug, Clone)]
pub struct ConvNeXtBlock {
    dwconv: CausalConv1d,
    norm_weight: Vec<f32>,
    norm_bias: Vec<f32>,
    pwconv1: QuantMatrix,
    pwconv1_bias: Vec<f32>,
    pwconv2: QuantMatrix,
    pwconv2_bias: Vec<f32>,
    gamma: Vec<f32>,
}

impl ConvNeXtBlock {
    pub fn load(store: &WeightStore, prefix: &str, dim: usize) -> Result<Self, LoadError> {
        let dwconv = CausalConv1d::load(store, &format!("{prefix}.dwconv.conv"), dim, dim, DWCONV_KERNEL, 1, dim)?;
        let zeros = |n: usize| vec![0.0f32; n];
        Ok(Self {
            dwconv,
            norm_weight: store.load_f32(&format!("{prefix}.norm.weight"), &[dim])?,
            norm_bias: store.load_f32(&format!("{prefix}.norm.bias"), &[dim])?,
            pwconv1: store.load_matrix(&format!("{prefix}.pwconv1.weight"), 4 * dim, dim, Encoding::F32)?,
            pwconv1_bias: store
                .load_f32_optional(&format!("{prefix}.pwconv1.bias"), &[4 * dim])?
                .unwrap_or_else(|| zeros(4 * dim)),
            pwconv2: store.load_matrix(&format!("{prefix}.pwconv2.weight"), dim, 4 * dim, Encoding::F32)?,
            pwconv2_bias: store
                .load_f32_optional(&format!("{prefix}.pwconv2.bias"), &[dim])?
                .unwrap_or_else(|| zeros(dim)),
            gamma: store.load_f32(&format!("{prefix}.gamma"), &[dim])?,
        })
    }

    pub fn dim(&self) -> usize {
        self.gamma.len()
    }

    /// Past samples the depthwise conv reads.
    pub fn reach(&self) -> usize {
        self.dwconv.state_len()
    }

    /// Zeroed depthwise-conv tail for incremental use.
    pub fn new_state(&self) -> Vec<f32> {
        self.dwconv.new_state()
    }

    /// In place on a channel-major `[dim, length]` buffer.
    pub fn forward(&self, pool: &KernelPool, x: &mut [f32], length: usize) {
        let mut state = self.new_state();
        self.forward_incremental(pool, x, length, &mut state);
    }

    /// Like [`Self::forward`] but continues the depthwise conv from `state`.
    pub fn forward_incremental(&self, pool: &KernelPool, x: &mut [f32], length: usize, state: &mut [f32]) {
        let dim = self.dim();
        let conv = self.dwconv.forward_incremental(pool, x, length, state);

        let mut col = vec![0.0f32; dim];
        let mut normed = vec![0.0f32; dim];
        let mut wide = vec![0.0f32; 4 * dim];
        let mut proj = vec![0.0f32; dim];
        for t in 0..length {
            for (c, v) in col.iter_mut().enumerate() {
                *v = conv[c * length + t];
            }
            layer_norm(&mut normed, &col, &self.norm_weight, &self.norm_bias, LAYER_NORM_EPS);
            self.pwconv1.matvec(pool, &normed, &mut wide);
            for (w, b) in wide.iter_mut().zip(&self.pwconv1_bias) {
                *w += b;
            }
            gelu_inplace(&mut wide);
            self.pwconv2.matvec(pool, &wide, &mut proj);
            for c in 0..dim {
                x[c * length + t] += (proj[c] + self.pwconv2_bias[c]) * self.gamma[c];
            }
        }
    }
}
