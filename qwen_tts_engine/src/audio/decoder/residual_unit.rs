//! Vocoder blocks: snake activation, transposed-conv upsampling and dilated
//! residual units.

use crate::audio::decoder::stream::BlockStreamState;
use crate::audio::tokenizer::v2::{
    causal_conv::{CausalConv1d, CausalConvTranspose1d},
    snake_beta::SnakeBeta,
};
use crate::error::LoadError;
use crate::io::WeightStore;
use crate::quant::KernelPool;

/// Dilations of the three residual units in every block.
pub const RESIDUAL_DILATIONS: [usize; 3] = [1, 3, 9];

const RESIDUAL_KERNEL: usize = 7;

/// Residual unit for the vocoder.
#[derive(Debug, Clone)]
pub struct DecoderResidualUnit {
    act1: SnakeBeta,
    conv1: CausalConv1d,
    act2: SnakeBeta,
    conv2: CausalConv1d,
}

impl DecoderResidualUnit {
    pub fn load(store: &WeightStore, prefix: &str, dim: usize, dilation: usize) -> Result<Self, LoadError> {
        Ok(Self {
            act1: SnakeBeta::load(store, &format!("{prefix}.act1"), dim)?,
            conv1: CausalConv1d::load(store, &format!("{prefix}.conv1.conv"), dim, dim, RESIDUAL_KERNEL, dilation, 1)?,
            act2: SnakeBeta::load(store, &format!("{prefix}.act2"), dim)?,
            conv2: CausalConv1d::load(store, &format!("{prefix}.conv2.conv"), dim, dim, 1, 1, 1)?,
        })
    }

    /// Zeroed conv1 tail. conv2 has kernel size 1 and needs no state.
    pub fn new_state(&self) -> Vec<f32> {
        self.conv1.new_state()
    }

    /// In place on `[dim, length]`, continuing conv1 from `state`.
    pub fn forward_incremental(&self, pool: &KernelPool, x: &mut [f32], length: usize, state: &mut [f32]) {
        let mut hidden = x.to_vec();
        self.act1.forward_inplace(&mut hidden, length);
        let mut hidden = self.conv1.forward_incremental(pool, &hidden, length, state);
        self.act2.forward_inplace(&mut hidden, length);
        let hidden = self.conv2.forward(pool, &hidden, length);
        for (v, h) in x.iter_mut().zip(&hidden) {
            *v += h;
        }
    }
}

/// Decoder block with upsampling and residual units.
#[derive(Debug, Clone)]
pub struct DecoderBlock {
    act: SnakeBeta,
    upsample: CausalConvTranspose1d,
    residual_units: Vec<DecoderResidualUnit>,
}

impl DecoderBlock {
    /// Load `{prefix}.block.*` for an `in_dim → in_dim / 2` block upsampling by `rate`.
    pub fn load(store: &WeightStore, prefix: &str, in_dim: usize, rate: usize) -> Result<Self, LoadError> {
        let out_dim = in_dim / 2;
        let act = SnakeBeta::load(store, &format!("{prefix}.block.0"), in_dim)?;
        let upsample =
            CausalConvTranspose1d::load(store, &format!("{prefix}.block.1.conv"), in_dim, out_dim, 2 * rate, rate)?;
        let residual_units = RESIDUAL_DILATIONS
            .iter()
            .enumerate()
            .map(|(i, &dilation)| DecoderResidualUnit::load(store, &format!("{prefix}.block.{}", i + 2), out_dim, dilation))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            act,
            upsample,
            residual_units,
        })
    }

    pub fn stride(&self) -> usize {
        self.upsample.stride()
    }

    pub fn upsample(&self) -> &CausalConvTranspose1d {
        &self.upsample
    }

    /// Past output-rate samples read by the residual units together.
    pub fn residual_reach(&self) -> usize {
        self.residual_units.iter().map(|unit| unit.conv1.state_len()).sum()
    }

    pub fn new_state(&self) -> BlockStreamState {
        BlockStreamState {
            overlap: self.upsample.new_state(),
            units: self.residual_units.iter().map(DecoderResidualUnit::new_state).collect(),
        }
    }

    /// `[in_dim, length]` → `[in_dim / 2, length * stride]`.
    pub fn forward(&self, pool: &KernelPool, x: &[f32], length: usize) -> Vec<f32> {
        let mut state = self.new_state();
        self.forward_incremental(pool, x, length, &mut state)
    }

    pub fn forward_incremental(
        &self,
        pool: &KernelPool,
        x: &[f32],
        length: usize,
        state: &mut BlockStreamState,
    ) -> Vec<f32> {
        let mut hidden = x.to_vec();
        self.act.forward_inplace(&mut hidden, length);
        let mut hidden = self.upsample.forward_incremental(pool, &hidden, length, &mut state.overlap);
        let out_len = length * self.stride();
        for (unit, unit_state) in self.residual_units.iter().zip(state.units.iter_mut()) {
            unit.forward_incremental(pool, &mut hidden, out_len, unit_state);
        }
        hidden
    }
}
