//! Key-Value cache for autoregressive generation.
//!
//! Each layer owns two contiguous arenas of shape `[capacity, kv_dim]`.
//! Capacity and logical length are tracked separately: a forward pass writes
//! its new positions first and [`KVCache::commit`]s them once every layer has
//! run. Growth always moves to a freshly allocated arena.

/// Per-layer key/value arenas.
#[derive(Debug, Clone, Default)]
struct LayerArena {
    k: Vec<f32>,
    v: Vec<f32>,
}

/// Growable KV cache shared in shape by the talker, code predictor and codec transformer.
#[derive(Debug, Clone)]
pub struct KVCache {
    layers: Vec<LayerArena>,
    /// Width of one cached position (`num_kv_heads * head_dim`)
    kv_dim: usize,
    /// Allocated positions per layer
    capacity: usize,
    /// Committed positions; position `p` is valid iff `p < seq_len`
    seq_len: usize,
    /// Extra positions allocated on every growth
    growth: usize,
}

impl KVCache {
    /// Create a cache with `capacity` preallocated positions per layer.
    pub fn with_num_layers(num_layers: usize, kv_dim: usize, capacity: usize, growth: usize) -> Self {
        let layers = (0..num_layers)
            .map(|_| LayerArena {
                k: vec![0.0; capacity * kv_dim],
                v: vec![0.0; capacity * kv_dim],
            })
            .collect();
        Self {
            layers,
            kv_dim,
            capacity,
            seq_len: 0,
            growth,
        }
    }

    /// Get the current cached sequence length.
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn is_empty(&self) -> bool {
        self.seq_len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn kv_dim(&self) -> usize {
        self.kv_dim
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Next position to fill (the RoPE position of the next token).
    pub fn cache_position(&self) -> usize {
        self.seq_len
    }

    /// Forget every position. Capacity is kept.
    pub fn clear(&mut self) {
        self.seq_len = 0;
    }

    /// Make room for positions `[0, positions)`.
    ///
    /// When growth is needed the new capacity is `positions + growth`, and the
    /// committed prefix is copied into new arenas.
    pub fn reserve(&mut self, positions: usize) {
        if positions <= self.capacity {
            return;
        }
        let new_capacity = positions + self.growth;
        let keep = self.seq_len * self.kv_dim;
        for layer in &mut self.layers {
            let mut k = vec![0.0f32; new_capacity * self.kv_dim];
            let mut v = vec![0.0f32; new_capacity * self.kv_dim];
            k[..keep].copy_from_slice(&layer.k[..keep]);
            v[..keep].copy_from_slice(&layer.v[..keep]);
            layer.k = k;
            layer.v = v;
        }
        tracing::debug!(
            from = self.capacity,
            to = new_capacity,
            layers = self.layers.len(),
            "KV cache grown"
        );
        self.capacity = new_capacity;
    }

    /// Store K/V for `layer` at `pos`. The position becomes valid on [`Self::commit`].
    pub fn write(&mut self, layer: usize, pos: usize, k: &[f32], v: &[f32]) {
        assert!(pos < self.capacity, "KV write at {pos} beyond capacity {}", self.capacity);
        let start = pos * self.kv_dim;
        let end = start + self.kv_dim;
        let arena = &mut self.layers[layer];
        arena.k[start..end].copy_from_slice(k);
        arena.v[start..end].copy_from_slice(v);
    }

    /// Keys of `layer` for positions `[0, upto)`, row-major by position.
    pub fn keys(&self, layer: usize, upto: usize) -> &[f32] {
        &self.layers[layer].k[..upto * self.kv_dim]
    }

    /// Values of `layer` for positions `[0, upto)`.
    pub fn values(&self, layer: usize, upto: usize) -> &[f32] {
        &self.layers[layer].v[..upto * self.kv_dim]
    }

    /// Mark positions up to `seq_len` as valid.
    pub fn commit(&mut self, seq_len: usize) {
        assert!(seq_len <= self.capacity);
        self.seq_len = seq_len;
    }
}
