//! Split residual vector quantizer (decode direction only).
//!
//! Frame codes are dequantized into a `[codebook_dim]` latent: the first
//! codebook feeds the semantic branch, the remaining ones the acoustic
//! branch, and each branch is projected up before the two are summed.

use crate::audio::decoder::CodecConfig;
use crate::error::LoadError;
use crate::io::WeightStore;
use crate::quant::{Encoding, KernelPool, QuantMatrix};

const USAGE_EPS: f32 = 1e-5;

/// Euclidean codebook with its EMA embeddings resolved at load time.
#[derive(Debug, Clone)]
pub struct EuclideanCodebook {
    /// `embedding_sum / max(cluster_usage, eps)`, `[codebook_size, dim]`
    embeddings: Vec<f32>,
    codebook_size: usize,
    dim: usize,
}

impl EuclideanCodebook {
    pub fn new(embedding_sum: &[f32], cluster_usage: &[f32], dim: usize) -> Self {
        let codebook_size = cluster_usage.len();
        assert_eq!(embedding_sum.len(), codebook_size * dim);
        let mut embeddings = embedding_sum.to_vec();
        for (row, &usage) in embeddings.chunks_mut(dim).zip(cluster_usage) {
            let inv = 1.0 / usage.max(USAGE_EPS);
            row.iter_mut().for_each(|v| *v *= inv);
        }
        Self {
            embeddings,
            codebook_size,
            dim,
        }
    }

    pub fn load(store: &WeightStore, prefix: &str, codebook_size: usize, dim: usize) -> Result<Self, LoadError> {
        let usage = store.load_f32(&format!("{prefix}.cluster_usage"), &[codebook_size])?;
        let sum = store.load_f32(&format!("{prefix}.embedding_sum"), &[codebook_size, dim])?;
        Ok(Self::new(&sum, &usage, dim))
    }

    /// Embedding of `code`. Out-of-range codes read entry 0.
    pub fn entry(&self, code: u32) -> &[f32] {
        let code = code as usize;
        let idx = if code < self.codebook_size { code } else { 0 };
        &self.embeddings[idx * self.dim..(idx + 1) * self.dim]
    }
}

/// A group of codebooks whose entries are summed, then optionally projected.
#[derive(Debug, Clone)]
pub struct ResidualVectorQuantizer {
    layers: Vec<EuclideanCodebook>,
    /// `[output_dim, dim]`, from a kernel-size-1 conv
    output_proj: Option<QuantMatrix>,
    dim: usize,
    output_dim: usize,
}

impl ResidualVectorQuantizer {
    pub fn load(
        store: &WeightStore,
        prefix: &str,
        n_q: usize,
        codebook_size: usize,
        dim: usize,
        output_dim: usize,
    ) -> Result<Self, LoadError> {
        let layers = (0..n_q)
            .map(|i| EuclideanCodebook::load(store, &format!("{prefix}.vq.layers.{i}._codebook"), codebook_size, dim))
            .collect::<Result<Vec<_>, _>>()?;
        let proj_name = format!("{prefix}.output_proj.weight");
        let output_proj = match store.load_f32_optional(&proj_name, &[output_dim, dim, 1])? {
            Some(w) => Some(QuantMatrix::from_f32(w, output_dim, dim, Encoding::F32)),
            None => None,
        };
        Ok(Self {
            layers,
            output_proj,
            dim,
            output_dim,
        })
    }

    pub fn num_quantizers(&self) -> usize {
        self.layers.len()
    }

    /// Add the decoded contribution of `codes` (one per layer) into `out`.
    ///
    /// Without a projection the summed vector is copied into the leading
    /// `dim` channels and the rest are left untouched.
    fn decode_into(&self, pool: &KernelPool, codes: &[u32], sum: &mut Vec<f32>, proj: &mut Vec<f32>, out: &mut [f32]) {
        sum.clear();
        sum.resize(self.dim, 0.0);
        for (layer, &code) in self.layers.iter().zip(codes) {
            for (s, e) in sum.iter_mut().zip(layer.entry(code)) {
                *s += e;
            }
        }
        match &self.output_proj {
            Some(w) => {
                proj.resize(self.output_dim, 0.0);
                w.matvec(pool, sum, proj);
                for (o, p) in out.iter_mut().zip(proj.iter()) {
                    *o += p;
                }
            }
            None => {
                for (o, s) in out.iter_mut().zip(sum.iter()) {
                    *o += s;
                }
            }
        }
    }
}

/// Split Residual Vector Quantizer.
///
/// Splits quantizers into semantic (first N) and acoustic (rest) groups,
/// each with their own projections.
#[derive(Debug, Clone)]
pub struct SplitResidualVectorQuantizer {
    rvq_first: ResidualVectorQuantizer,
    rvq_rest: ResidualVectorQuantizer,
    n_q_semantic: usize,
    codebook_dim: usize,
}

impl SplitResidualVectorQuantizer {
    /// Load `{prefix}.rvq_first` (one codebook) and `{prefix}.rvq_rest`.
    pub fn load(store: &WeightStore, prefix: &str, config: &CodecConfig) -> Result<Self, LoadError> {
        let n_q_semantic = 1;
        let codebook_dim = config.codebook_dim;
        let vq_dim = codebook_dim / 2;
        let size = config.codebook_size;
        let rvq_first = ResidualVectorQuantizer::load(
            store,
            &format!("{prefix}.rvq_first"),
            n_q_semantic,
            size,
            vq_dim,
            codebook_dim,
        )?;
        let rvq_rest = ResidualVectorQuantizer::load(
            store,
            &format!("{prefix}.rvq_rest"),
            config.num_quantizers.saturating_sub(n_q_semantic),
            size,
            vq_dim,
            codebook_dim,
        )?;
        Ok(Self {
            rvq_first,
            rvq_rest,
            n_q_semantic,
            codebook_dim,
        })
    }

    pub fn num_quantizers(&self) -> usize {
        self.n_q_semantic + self.rvq_rest.num_quantizers()
    }

    pub fn codebook_dim(&self) -> usize {
        self.codebook_dim
    }

    /// Decode row-major frames of `stride` codes each into a channel-major
    /// `[codebook_dim, frames]` buffer. Only the first
    /// [`Self::num_quantizers`] codes of every frame are read.
    pub fn decode(&self, pool: &KernelPool, codes: &[u32], stride: usize) -> Vec<f32> {
        assert!(stride >= self.num_quantizers(), "frame stride {stride} below quantizer count");
        let frames = codes.len() / stride;
        let dim = self.codebook_dim;
        let mut out = vec![0.0f32; dim * frames];
        let mut latent = vec![0.0f32; dim];
        let (mut sum, mut proj) = (Vec::new(), Vec::new());
        for (t, frame) in codes.chunks_exact(stride).enumerate() {
            latent.fill(0.0);
            let (semantic, acoustic) = frame[..self.num_quantizers()].split_at(self.n_q_semantic);
            self.rvq_first.decode_into(pool, semantic, &mut sum, &mut proj, &mut latent);
            self.rvq_rest.decode_into(pool, acoustic, &mut sum, &mut proj, &mut latent);
            for (c, &v) in latent.iter().enumerate() {
                out[c * frames + t] = v;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codebook_normalizes_by_usage() {
        let sum = [2.0f32, 4.0, 3.0, 3.0];
        let usage = [2.0f32, 0.0];
        let book = EuclideanCodebook::new(&sum, &usage, 2);
        assert_eq!(book.entry(0), &[1.0, 2.0]);
        assert_eq!(book.entry(1), &[3.0 / USAGE_EPS, 3.0 / USAGE_EPS]);
        // Out of range falls back to the first entry.
        assert_eq!(book.entry(7), &[1.0, 2.0]);
    }

    #[test]
    fn test_unprojected_sum_is_zero_padded() {
        let rvq = ResidualVectorQuantizer {
            layers: vec![
                EuclideanCodebook::new(&[1.0, 1.0, 2.0, 2.0], &[1.0, 1.0], 2),
                EuclideanCodebook::new(&[10.0, 20.0, 30.0, 40.0], &[1.0, 1.0], 2),
            ],
            output_proj: None,
            dim: 2,
            output_dim: 4,
        };
        let mut out = vec![0.0f32; 4];
        let (mut sum, mut proj) = (Vec::new(), Vec::new());
        rvq.decode_into(&KernelPool::inline(), &[1, 0], &mut sum, &mut proj, &mut out);
        assert_eq!(out, vec![12.0, 22.0, 0.0, 0.0]);
    }

    #[test]
    fn test_split_decode_is_channel_major() {
        let book = |base: f32| EuclideanCodebook::new(&[base, base + 1.0, base + 2.0, base + 3.0], &[1.0, 1.0], 2);
        let proj = QuantMatrix::from_f32(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0], 4, 2, Encoding::F32);
        let split = SplitResidualVectorQuantizer {
            rvq_first: ResidualVectorQuantizer {
                layers: vec![book(0.0)],
                output_proj: Some(proj),
                dim: 2,
                output_dim: 4,
            },
            rvq_rest: ResidualVectorQuantizer {
                layers: vec![book(100.0)],
                output_proj: None,
                dim: 2,
                output_dim: 4,
            },
            n_q_semantic: 1,
            codebook_dim: 4,
        };
        // Two frames with a trailing unused group each.
        let codes = [1, 0, 9, 0, 1, 9];
        let out = split.decode(&KernelPool::inline(), &codes, 3);
        // Frame 0: semantic [2, 3] projected to [2, 3, 5, 0]; acoustic [100, 101].
        // Frame 1: semantic [0, 1] projected to [0, 1, 1, 0]; acoustic [102, 103].
        assert_eq!(out, vec![102.0, 102.0, 104.0, 104.0, 5.0, 1.0, 0.0, 0.0]);
    }
}
