//! Code predictor (sub-talker) for code groups 1..N of a frame.
//!
//! After the talker samples group 0, the code predictor runs a fresh short
//! sequence per frame:
//! - position 0: the talker's hidden state
//! - position 1: the talker's codec embedding of group 0, whose output samples group 1
//! - position g: the per-group embedding of group g-1, whose output samples group g
//!
//! Inputs are projected from talker width into code predictor width first.

use crate::error::LoadError;
use crate::io::{EmbeddingTable, WeightStore};
use crate::nn::mt_rng::MtRng;
use crate::nn::sampling::{Sampler, SamplingParams};
use crate::nn::transformer::{Transformer, TransformerState};
use crate::quant::{KernelPool, QuantMatrix};

/// Talker-width → code-predictor-width projection with bias.
#[derive(Debug, Clone)]
pub struct InputProjection {
    pub weight: QuantMatrix,
    pub bias: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct CodePredictor {
    pub transformer: Transformer,
    /// Absent when the talker and code predictor share a width
    pub input_proj: Option<InputProjection>,
    /// `groups - 1` tables of `[vocab, talker_hidden]`; table `i` embeds group `i + 1`
    pub embeddings: Vec<EmbeddingTable>,
    /// `groups - 1` heads of `[vocab, hidden]`; head `i` samples group `i + 1`
    pub lm_heads: Vec<QuantMatrix>,
}

/// Reusable buffers for [`CodePredictor::predict`].
#[derive(Debug, Clone, Default)]
pub struct PredictorScratch {
    seq: Vec<f32>,
    hidden: Vec<f32>,
    emb: Vec<f32>,
    logits: Vec<f32>,
}

impl CodePredictor {
    pub fn hidden_size(&self) -> usize {
        self.transformer.hidden_size()
    }

    /// Code groups per frame, including group 0.
    pub fn num_groups(&self) -> usize {
        self.lm_heads.len() + 1
    }

    pub fn vocab_size(&self) -> usize {
        self.lm_heads.first().map_or(0, QuantMatrix::rows)
    }

    /// Project a talker-width vector into `out`. Without a projection the
    /// vector is copied, truncated or zero-padded to fit.
    pub fn project(&self, pool: &KernelPool, x: &[f32], out: &mut [f32]) {
        match &self.input_proj {
            Some(p) => {
                p.weight.matvec(pool, x, out);
                for (o, b) in out.iter_mut().zip(&p.bias) {
                    *o += b;
                }
            }
            None => {
                let n = x.len().min(out.len());
                out[..n].copy_from_slice(&x[..n]);
                out[n..].fill(0.0);
            }
        }
    }

    /// Fill `codes[1..]` for one frame. `codes[0]` must already hold the
    /// talker's sampled code and `talker_hidden` its final-normed hidden state.
    ///
    /// The cache in `state` is reset first; nothing carries across frames.
    #[allow(clippy::too_many_arguments)]
    pub fn predict(
        &self,
        store: &WeightStore,
        pool: &KernelPool,
        state: &mut TransformerState,
        talker_codec_embedding: &EmbeddingTable,
        talker_hidden: &[f32],
        params: &SamplingParams,
        sampler: &mut Sampler,
        rng: &mut MtRng,
        codes: &mut [u32],
        scratch: &mut PredictorScratch,
    ) -> Result<(), LoadError> {
        let groups = self.num_groups();
        debug_assert_eq!(codes.len(), groups);
        let h = self.hidden_size();
        scratch.seq.resize(2 * h, 0.0);
        scratch.emb.resize(talker_hidden.len(), 0.0);
        scratch.logits.resize(self.vocab_size(), 0.0);

        let (first, second) = scratch.seq.split_at_mut(h);
        self.project(pool, talker_hidden, first);
        talker_codec_embedding.lookup(store, codes[0] as usize, &mut scratch.emb)?;
        self.project(pool, &scratch.emb, second);
        self.transformer.prefill(pool, state, &mut scratch.seq);

        let hidden = &mut scratch.hidden;
        hidden.clear();
        hidden.extend_from_slice(&scratch.seq[h..2 * h]);
        for g in 1..groups {
            if g > 1 {
                self.embeddings[g - 2].lookup(store, codes[g - 1] as usize, &mut scratch.emb)?;
                self.project(pool, &scratch.emb, hidden);
                self.transformer.decode(pool, state, hidden);
            }
            self.lm_heads[g - 1].matvec(pool, hidden, &mut scratch.logits);
            codes[g] = sampler.sample(&scratch.logits, params, rng) as u32;
        }
        Ok(())
    }

    /// `acc += Σ_{g ≥ 1} embeddings[g - 1][codes[g]]`
    pub fn add_group_embeddings(
        &self,
        store: &WeightStore,
        codes: &[u32],
        acc: &mut [f32],
        scratch: &mut Vec<f32>,
    ) -> Result<(), LoadError> {
        for (table, &code) in self.embeddings.iter().zip(&codes[1..]) {
            table.accumulate(store, code as usize, acc, scratch)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::attention::AttentionShape;
    use crate::nn::decoder_layer::{LayerDims, LayerWeights};
    use crate::nn::rope::RopeTable;
    use crate::quant::Encoding;
    use candle_core::{DType, Device, Tensor};
    use std::collections::HashMap;

    const TALKER_HIDDEN: usize = 12;
    const HIDDEN: usize = 8;
    const VOCAB: usize = 16;
    const GROUPS: usize = 4;

    fn matrix(rows: usize, cols: usize, seed: usize) -> QuantMatrix {
        let w = (0..rows * cols)
            .map(|i| ((((i + seed) * 7919) % 101) as f32 / 101.0 - 0.5) * 0.4)
            .collect();
        QuantMatrix::from_f32(w, rows, cols, Encoding::F32)
    }

    fn fixture(dir: &std::path::Path) -> anyhow::Result<(WeightStore, CodePredictor, EmbeddingTable)> {
        let dev = Device::Cpu;
        let mut tensors = HashMap::new();
        for name in ["talker_codec", "emb.0", "emb.1", "emb.2"] {
            let data: Vec<f32> = (0..VOCAB * TALKER_HIDDEN)
                .map(|i| ((i * 31 + name.len() * 7) % 19) as f32 / 19.0 - 0.5)
                .collect();
            tensors.insert(name.to_string(), Tensor::from_vec(data, (VOCAB, TALKER_HIDDEN), &dev)?.to_dtype(DType::BF16)?);
        }
        candle_core::safetensors::save(&tensors, dir.join("model.safetensors"))?;
        let store = WeightStore::open(dir)?;

        let dims = LayerDims {
            hidden: HIDDEN,
            intermediate: 16,
            attention: AttentionShape {
                num_heads: 2,
                num_kv_heads: 1,
                head_dim: 4,
                window: None,
            },
            eps: 1e-6,
        };
        let layer = LayerWeights {
            input_norm: vec![1.0; HIDDEN],
            post_attention_norm: vec![1.0; HIDDEN],
            q_norm: Some(vec![1.0; 4]),
            k_norm: Some(vec![1.0; 4]),
            wqkv: matrix(16, HIDDEN, 1),
            wo: matrix(HIDDEN, 8, 2),
            gate_up: matrix(32, HIDDEN, 3),
            down: matrix(HIDDEN, 16, 4),
            attn_layer_scale: None,
            mlp_layer_scale: None,
        };
        let embeddings = (0..GROUPS - 1)
            .map(|i| EmbeddingTable::bind(&store, &format!("emb.{i}"), VOCAB, TALKER_HIDDEN))
            .collect::<Result<Vec<_>, _>>()?;
        let predictor = CodePredictor {
            transformer: Transformer {
                dims,
                layers: vec![layer],
                norm: Some(vec![1.0; HIDDEN]),
            },
            input_proj: Some(InputProjection {
                weight: matrix(HIDDEN, TALKER_HIDDEN, 5),
                bias: vec![0.01; HIDDEN],
            }),
            embeddings,
            lm_heads: (0..GROUPS - 1).map(|g| matrix(VOCAB, HIDDEN, 10 + g)).collect(),
        };
        let talker_codec = EmbeddingTable::bind(&store, "talker_codec", VOCAB, TALKER_HIDDEN)?;
        Ok((store, predictor, talker_codec))
    }

    fn run(predictor: &CodePredictor, store: &WeightStore, talker_codec: &EmbeddingTable, seed: u64) -> Vec<u32> {
        run_with(predictor, store, talker_codec, seed, &mut PredictorScratch::default())
    }

    fn run_with(
        predictor: &CodePredictor,
        store: &WeightStore,
        talker_codec: &EmbeddingTable,
        seed: u64,
        scratch: &mut PredictorScratch,
    ) -> Vec<u32> {
        let pool = KernelPool::inline();
        let mut state = TransformerState::new(&predictor.transformer, RopeTable::new(4, 10000.0), GROUPS + 2, 16);
        let hidden: Vec<f32> = (0..TALKER_HIDDEN).map(|i| (i as f32 * 0.37).sin()).collect();
        let mut codes = vec![3u32, 0, 0, 0];
        let mut rng = MtRng::new(seed);
        predictor.predict(
            store,
            &pool,
            &mut state,
            talker_codec,
            &hidden,
            &SamplingParams::default(),
            &mut Sampler::new(),
            &mut rng,
            &mut codes,
            scratch,
        )
        .unwrap();
        assert_eq!(state.seq_len(), GROUPS);
        codes
    }

    #[test]
    fn test_predict_fills_every_group_deterministically() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (store, predictor, talker_codec) = fixture(dir.path())?;
        let a = run(&predictor, &store, &talker_codec, 7);
        let b = run(&predictor, &store, &talker_codec, 7);
        assert_eq!(a, b);
        assert_eq!(a[0], 3);
        assert!(a.iter().all(|&c| (c as usize) < VOCAB));
        Ok(())
    }

    #[test]
    fn test_reused_scratch_matches_fresh() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (store, predictor, talker_codec) = fixture(dir.path())?;
        let mut scratch = PredictorScratch::default();
        for seed in [3, 11, 3] {
            let reused = run_with(&predictor, &store, &talker_codec, seed, &mut scratch);
            assert_eq!(reused, run(&predictor, &store, &talker_codec, seed));
        }
        assert_eq!(scratch.hidden.len(), HIDDEN);
        Ok(())
    }

    #[test]
    fn test_project_without_weights_pads() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (_store, mut predictor, _) = fixture(dir.path())?;
        predictor.input_proj = None;
        let mut out = [9.0f32; HIDDEN];
        predictor.project(&KernelPool::inline(), &[1.0, 2.0, 3.0], &mut out);
        assert_eq!(out, [1.0, 2.0, 3.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        Ok(())
    }
}
