//! The talker: text projection, codec embeddings, transformer and codec head.
//!
//! The talker predicts code group 0 of every frame. Its input at each step is
//! a sum of embeddings built by the generation loop; this module only owns
//! the weights and the per-token building blocks.

use crate::error::LoadError;
use crate::io::{EmbeddingTable, WeightStore};
use crate::nn::mlp::silu_inplace;
use crate::nn::transformer::{Transformer, TransformerState};
use crate::quant::{KernelPool, QuantMatrix};

/// Two-layer MLP mapping text embeddings into the talker width:
/// `fc2(silu(fc1(x) + b1)) + b2`.
#[derive(Debug, Clone)]
pub struct TextProjection {
    pub fc1: QuantMatrix,
    pub fc1_bias: Vec<f32>,
    pub fc2: QuantMatrix,
    pub fc2_bias: Vec<f32>,
}

impl TextProjection {
    pub fn forward(&self, pool: &KernelPool, x: &[f32], out: &mut [f32], scratch: &mut Vec<f32>) {
        scratch.resize(self.fc1.rows(), 0.0);
        self.fc1.matvec(pool, x, scratch);
        for (h, b) in scratch.iter_mut().zip(&self.fc1_bias) {
            *h += b;
        }
        silu_inplace(scratch);
        self.fc2.matvec(pool, scratch, out);
        for (o, b) in out.iter_mut().zip(&self.fc2_bias) {
            *o += b;
        }
    }
}

/// Reusable buffers for talker embedding lookups.
#[derive(Debug, Clone, Default)]
pub struct TalkerScratch {
    text: Vec<f32>,
    mid: Vec<f32>,
    row: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct Talker {
    pub transformer: Transformer,
    /// `[text_vocab, text_hidden]`, read from the mapping
    pub text_embedding: EmbeddingTable,
    /// `[vocab, hidden]`, read from the mapping
    pub codec_embedding: EmbeddingTable,
    pub text_projection: TextProjection,
    /// `[vocab, hidden]`
    pub codec_head: QuantMatrix,
}

impl Talker {
    pub fn hidden_size(&self) -> usize {
        self.transformer.hidden_size()
    }

    pub fn vocab_size(&self) -> usize {
        self.codec_head.rows()
    }

    pub fn text_vocab_size(&self) -> usize {
        self.text_embedding.rows()
    }

    /// `out = text_projection(text_embedding[token])`
    pub fn embed_text(
        &self,
        store: &WeightStore,
        pool: &KernelPool,
        token: u32,
        out: &mut [f32],
        scratch: &mut TalkerScratch,
    ) -> Result<(), LoadError> {
        scratch.text.resize(self.text_embedding.cols(), 0.0);
        self.text_embedding.lookup(store, token as usize, &mut scratch.text)?;
        self.text_projection.forward(pool, &scratch.text, out, &mut scratch.mid);
        Ok(())
    }

    /// `out += codec_embedding[token]`
    pub fn add_codec(
        &self,
        store: &WeightStore,
        token: u32,
        out: &mut [f32],
        scratch: &mut TalkerScratch,
    ) -> Result<(), LoadError> {
        self.codec_embedding.accumulate(store, token as usize, out, &mut scratch.row)
    }

    /// Reset the cache and run the prompt. On return every row of `embeds`
    /// holds its final-normed hidden state; the last row feeds step 0.
    pub fn prefill(&self, pool: &KernelPool, state: &mut TransformerState, embeds: &mut [f32]) {
        self.transformer.prefill(pool, state, embeds);
    }

    /// One decode step in place on `hidden`.
    pub fn step(&self, pool: &KernelPool, state: &mut TransformerState, hidden: &mut [f32]) {
        self.transformer.decode(pool, state, hidden);
    }

    /// `logits = codec_head · hidden`
    pub fn logits(&self, pool: &KernelPool, hidden: &[f32], logits: &mut [f32]) {
        self.codec_head.matvec(pool, hidden, logits);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::mlp::silu;
    use crate::quant::Encoding;

    #[test]
    fn test_text_projection_matches_dense_reference() {
        let (d_in, d_mid, d_out) = (4, 3, 2);
        let w1: Vec<f32> = (0..d_mid * d_in).map(|i| (i as f32 - 5.0) * 0.1).collect();
        let w2: Vec<f32> = (0..d_out * d_mid).map(|i| (i as f32 - 2.0) * 0.2).collect();
        let proj = TextProjection {
            fc1: QuantMatrix::from_f32(w1.clone(), d_mid, d_in, Encoding::F32),
            fc1_bias: vec![0.1, -0.1, 0.0],
            fc2: QuantMatrix::from_f32(w2.clone(), d_out, d_mid, Encoding::F32),
            fc2_bias: vec![0.5, -0.5],
        };
        let x = [1.0f32, -2.0, 0.5, 3.0];
        let mut out = [0.0f32; 2];
        proj.forward(&KernelPool::inline(), &x, &mut out, &mut Vec::new());

        let h: Vec<f32> = (0..d_mid)
            .map(|r| {
                let z: f32 = (0..d_in).map(|c| w1[r * d_in + c] * x[c]).sum::<f32>() + proj.fc1_bias[r];
                silu(z)
            })
            .collect();
        for r in 0..d_out {
            let expected: f32 = (0..d_mid).map(|c| w2[r * d_mid + c] * h[c]).sum::<f32>() + proj.fc2_bias[r];
            assert!((out[r] - expected).abs() < 1e-5);
        }
    }
}
