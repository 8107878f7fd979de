//! Sliding-window transformer between the codec pre-conv and upsampler.
//!
//! Same layer shape as the talker minus the per-head QK norms, plus
//! per-channel layer scales on both residual branches. All layer matrices
//! are Q8_0; the latent projections stay f32.

use crate::audio::decoder::CodecConfig;
use crate::error::LoadError;
use crate::io::WeightStore;
use crate::nn::attention::AttentionShape;
use crate::nn::decoder_layer::{LayerDims, LayerWeights};
use crate::nn::rope::RopeTable;
use crate::nn::transformer::{Transformer, TransformerState};
use crate::quant::{Encoding, KernelPool, QuantMatrix};

/// Extra KV positions allocated when a stream outgrows its cache.
pub const CODEC_KV_GROWTH: usize = 256;

/// Linear layer with bias, used for the latent ↔ hidden projections.
#[derive(Debug, Clone)]
struct Projection {
    weight: QuantMatrix,
    bias: Vec<f32>,
}

impl Projection {
    fn load(store: &WeightStore, prefix: &str, rows: usize, cols: usize) -> Result<Self, LoadError> {
        Ok(Self {
            weight: store.load_matrix(&format!("{prefix}.weight"), rows, cols, Encoding::F32)?,
            bias: store
                .load_f32_optional(&format!("{prefix}.bias"), &[rows])?
                .unwrap_or_else(|| vec![0.0; rows]),
        })
    }

    fn forward(&self, pool: &KernelPool, x: &[f32], out: &mut [f32]) {
        self.weight.matvec(pool, x, out);
        for (o, b) in out.iter_mut().zip(&self.bias) {
            *o += b;
        }
    }
}

#[derive(Debug, Clone)]
pub struct CodecTransformer {
    input_proj: Projection,
    transformer: Transformer,
    output_proj: Projection,
    latent_dim: usize,
    head_dim: usize,
    rope_theta: f64,
}

impl CodecTransformer {
    pub fn load(store: &WeightStore, prefix: &str, config: &CodecConfig) -> Result<Self, LoadError> {
        let hidden = config.hidden_size;
        let head_dim = config.head_dim();
        let dims = LayerDims {
            hidden,
            intermediate: config.intermediate_size,
            attention: AttentionShape {
                num_heads: config.num_attention_heads,
                num_kv_heads: config.num_key_value_heads,
                head_dim,
                window: Some(config.sliding_window),
            },
            eps: config.rms_norm_eps as f32,
        };
        let q_dim = dims.attention.q_dim();
        let kv_dim = dims.attention.kv_dim();
        let inter = dims.intermediate;

        let layers = (0..config.num_hidden_layers)
            .map(|i| {
                let p = format!("{prefix}.layers.{i}");
                let name = |s: &str| format!("{p}.{s}");
                Ok(LayerWeights {
                    input_norm: store.load_f32(&name("input_layernorm.weight"), &[hidden])?,
                    post_attention_norm: store.load_f32(&name("post_attention_layernorm.weight"), &[hidden])?,
                    q_norm: None,
                    k_norm: None,
                    wqkv: store.load_fused(
                        &[
                            (name("self_attn.q_proj.weight").as_str(), q_dim),
                            (name("self_attn.k_proj.weight").as_str(), kv_dim),
                            (name("self_attn.v_proj.weight").as_str(), kv_dim),
                        ],
                        hidden,
                        Encoding::Q8_0,
                    )?,
                    wo: store.load_matrix(&name("self_attn.o_proj.weight"), hidden, q_dim, Encoding::Q8_0)?,
                    gate_up: store.load_fused(
                        &[(name("mlp.gate_proj.weight").as_str(), inter), (name("mlp.up_proj.weight").as_str(), inter)],
                        hidden,
                        Encoding::Q8_0,
                    )?,
                    down: store.load_matrix(&name("mlp.down_proj.weight"), hidden, inter, Encoding::Q8_0)?,
                    attn_layer_scale: store.load_f32_optional(&name("self_attn_layer_scale.scale"), &[hidden])?,
                    mlp_layer_scale: store.load_f32_optional(&name("mlp_layer_scale.scale"), &[hidden])?,
                })
            })
            .collect::<Result<Vec<_>, LoadError>>()?;

        tracing::debug!(
            layers = layers.len(),
            hidden,
            window = config.sliding_window,
            "codec transformer loaded"
        );

        Ok(Self {
            input_proj: Projection::load(store, &format!("{prefix}.input_proj"), hidden, config.latent_dim)?,
            transformer: Transformer {
                dims,
                layers,
                norm: store.load_f32_optional(&format!("{prefix}.norm.weight"), &[hidden])?,
            },
            output_proj: Projection::load(store, &format!("{prefix}.output_proj"), config.latent_dim, hidden)?,
            latent_dim: config.latent_dim,
            head_dim,
            rope_theta: config.rope_theta,
        })
    }

    /// Past positions one output row can depend on through every layer.
    pub fn reach(&self) -> usize {
        let window = self.transformer.dims.attention.window.unwrap_or(0);
        self.transformer.layers.len() * window.saturating_sub(1)
    }

    /// Empty state with room for `capacity` positions.
    pub fn new_state(&self, capacity: usize) -> TransformerState {
        TransformerState::new(
            &self.transformer,
            RopeTable::new(self.head_dim, self.rope_theta),
            capacity,
            CODEC_KV_GROWTH,
        )
    }

    /// Append `latent = [T, latent_dim]` rows after the positions already in
    /// `state` and return the refined `[T, latent_dim]` rows.
    pub fn forward(&self, pool: &KernelPool, state: &mut TransformerState, latent: &[f32]) -> Vec<f32> {
        let hidden = self.transformer.hidden_size();
        let n = latent.len() / self.latent_dim;
        let mut x = vec![0.0f32; n * hidden];
        for (row, out) in latent.chunks(self.latent_dim).zip(x.chunks_mut(hidden)) {
            self.input_proj.forward(pool, row, out);
        }
        self.transformer.forward(pool, state, &mut x);
        let mut out = vec![0.0f32; n * self.latent_dim];
        for (row, o) in x.chunks(hidden).zip(out.chunks_mut(self.latent_dim)) {
            self.output_proj.forward(pool, row, o);
        }
        out
    }
}
