//! A stack of decoder layers plus the KV cache and rotary table that drive it.
//!
//! State per instance is `Empty → Prefilled(n) → Decoding(n + 1) → …`, read
//! off the cache length: [`Transformer::prefill`] resets and fills positions
//! `[0, L)`, [`Transformer::decode`] appends exactly one position.

use crate::nn::decoder_layer::{LayerDims, LayerScratch, LayerWeights, forward_layer};
use crate::nn::kv_cache::KVCache;
use crate::nn::norm::rms_norm_inplace;
use crate::nn::rope::RopeTable;
use crate::quant::KernelPool;

#[derive(Debug, Clone)]
pub struct Transformer {
    pub dims: LayerDims,
    pub layers: Vec<LayerWeights>,
    /// Final RMS norm applied to every output token
    pub norm: Option<Vec<f32>>,
}

/// Mutable per-instance state: cache, rotary table and scratch buffers.
#[derive(Debug, Clone)]
pub struct TransformerState {
    pub cache: KVCache,
    pub rope: RopeTable,
    scratch: LayerScratch,
}

impl TransformerState {
    pub fn new(transformer: &Transformer, rope: RopeTable, capacity: usize, growth: usize) -> Self {
        let cache = KVCache::with_num_layers(
            transformer.layers.len(),
            transformer.dims.attention.kv_dim(),
            capacity,
            growth,
        );
        Self {
            cache,
            rope,
            scratch: LayerScratch::default(),
        }
    }

    pub fn seq_len(&self) -> usize {
        self.cache.seq_len()
    }

    pub fn reset(&mut self) {
        self.cache.clear();
    }
}

impl Transformer {
    pub fn hidden_size(&self) -> usize {
        self.dims.hidden
    }

    /// Reset the cache and run `hidden = [L, hidden_size]` from position 0.
    pub fn prefill(&self, pool: &KernelPool, state: &mut TransformerState, hidden: &mut [f32]) {
        state.reset();
        self.forward(pool, state, hidden);
    }

    /// Run one token at the next cache position.
    pub fn decode(&self, pool: &KernelPool, state: &mut TransformerState, hidden: &mut [f32]) {
        debug_assert_eq!(hidden.len(), self.dims.hidden);
        self.forward(pool, state, hidden);
    }

    /// Append `hidden.len() / hidden_size` tokens after the cached prefix.
    ///
    /// Every output row is normalized by the final norm when present.
    pub fn forward(&self, pool: &KernelPool, state: &mut TransformerState, hidden: &mut [f32]) {
        let h = self.dims.hidden;
        let n = hidden.len() / h;
        if n == 0 {
            return;
        }
        let start = state.cache.seq_len();
        state.cache.reserve(start + n);
        state.rope.ensure(start + n);
        for (idx, layer) in self.layers.iter().enumerate() {
            forward_layer(
                layer,
                &self.dims,
                idx,
                hidden,
                start,
                &state.rope,
                &mut state.cache,
                pool,
                &mut state.scratch,
            );
        }
        state.cache.commit(start + n);
        if let Some(norm) = &self.norm {
            for row in hidden.chunks_mut(h) {
                rms_norm_inplace(row, norm, self.dims.eps);
            }
        }
    }
}
