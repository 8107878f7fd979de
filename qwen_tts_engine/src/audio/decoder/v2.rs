//! The 12Hz codec decoder: code frames in, 24kHz PCM out.
//!
//! Every stage is causal, so a batch decode is simply an incremental decode
//! of all frames from a fresh [`CodecStreamState`]. Streaming callers keep
//! the state and feed frames as they arrive.

use crate::audio::decoder::config::CodecConfig;
use crate::audio::decoder::residual_unit::DecoderBlock;
use crate::audio::decoder::stream::CodecStreamState;
use crate::audio::quantizer::SplitResidualVectorQuantizer;
use crate::audio::tokenizer::v2::{
    causal_conv::{CausalConv1d, CausalConvTranspose1d},
    convnext::ConvNeXtBlock,
    snake_beta::SnakeBeta,
    transformer::CodecTransformer,
};
use crate::error::LoadError;
use crate::io::WeightStore;
use crate::quant::KernelPool;

/// Tensor prefix of the decoder inside the speech tokenizer checkpoint.
pub const DECODER_PREFIX: &str = "decoder";

/// Initial codec transformer KV capacity of a stream.
const STREAM_KV_CAPACITY: usize = 256;

/// Largest batch/incremental difference [`IncrementalCheck::passed`] accepts.
pub const INCREMENTAL_TOLERANCE: f32 = 1e-4;

/// Batch vs frame-by-frame comparison produced by [`CodecDecoder::verify_incremental`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IncrementalCheck {
    pub batch_len: usize,
    pub incremental_len: usize,
    pub max_abs_diff: f32,
    pub mean_abs_diff: f32,
}

impl IncrementalCheck {
    pub fn passed(&self) -> bool {
        self.batch_len == self.incremental_len && self.max_abs_diff < INCREMENTAL_TOLERANCE
    }
}

/// Complete decoder for the 12Hz tokenizer.
#[derive(Debug, Clone)]
pub struct CodecDecoder {
    config: CodecConfig,
    quantizer: SplitResidualVectorQuantizer,
    pre_conv: CausalConv1d,
    pre_transformer: CodecTransformer,
    upsample_blocks: Vec<(CausalConvTranspose1d, ConvNeXtBlock)>,
    decoder_pre_conv: CausalConv1d,
    decoder_blocks: Vec<DecoderBlock>,
    decoder_final_act: SnakeBeta,
    decoder_final_conv: CausalConv1d,
}

impl CodecDecoder {
    /// Load every decoder tensor into owned buffers. `store` may be dropped afterwards.
    pub fn load(store: &WeightStore, config: &CodecConfig) -> Result<Self, LoadError> {
        config.validate()?;
        tracing::debug!(
            codebook_dim = config.codebook_dim,
            codebook_size = config.codebook_size,
            hidden_size = config.hidden_size,
            latent_dim = config.latent_dim,
            num_quantizers = config.num_quantizers,
            num_hidden_layers = config.num_hidden_layers,
            decoder_dim = config.decoder_dim,
            upsample_rates = ?config.upsample_rates,
            upsampling_ratios = ?config.upsampling_ratios,
            sliding_window = config.sliding_window,
            "decoder config"
        );
        let p = |s: &str| format!("{DECODER_PREFIX}.{s}");
        let latent = config.latent_dim;

        let quantizer = SplitResidualVectorQuantizer::load(store, &p("quantizer"), config)?;
        let pre_conv = CausalConv1d::load(store, &p("pre_conv.conv"), config.codebook_dim, latent, 3, 1, 1)?;
        let pre_transformer = CodecTransformer::load(store, &p("pre_transformer"), config)?;

        let upsample_blocks = config
            .upsampling_ratios
            .iter()
            .enumerate()
            .map(|(i, &factor)| {
                let upsample =
                    CausalConvTranspose1d::load(store, &p(&format!("upsample.{i}.0.conv")), latent, latent, factor, factor)?;
                let convnext = ConvNeXtBlock::load(store, &p(&format!("upsample.{i}.1")), latent)?;
                Ok((upsample, convnext))
            })
            .collect::<Result<Vec<_>, LoadError>>()?;

        let decoder_pre_conv = CausalConv1d::load(store, &p("decoder.0.conv"), latent, config.decoder_dim, 7, 1, 1)?;
        let decoder_blocks = config
            .upsample_rates
            .iter()
            .enumerate()
            .map(|(i, &rate)| {
                let in_dim = config.decoder_dim >> i;
                DecoderBlock::load(store, &p(&format!("decoder.{}", i + 1)), in_dim, rate)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let blocks = config.upsample_rates.len();
        let output_dim = config.vocoder_channels(blocks - 1);
        let decoder_final_act = SnakeBeta::load(store, &p(&format!("decoder.{}", blocks + 1)), output_dim)?;
        let decoder_final_conv =
            CausalConv1d::load(store, &p(&format!("decoder.{}.conv", blocks + 2)), output_dim, 1, 7, 1, 1)?;

        tracing::info!(
            samples_per_frame = config.samples_per_frame(),
            sample_rate = config.sample_rate,
            "codec decoder loaded"
        );

        Ok(Self {
            config: config.clone(),
            quantizer,
            pre_conv,
            pre_transformer,
            upsample_blocks,
            decoder_pre_conv,
            decoder_blocks,
            decoder_final_act,
            decoder_final_conv,
        })
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    pub fn samples_per_frame(&self) -> usize {
        self.config.samples_per_frame()
    }

    /// Left-context frames after which a frame's samples no longer depend on
    /// anything earlier. Decoding with at least this much context reproduces
    /// the batch output.
    pub fn receptive_field_frames(&self) -> usize {
        // Reach of each stage in fractions of a frame at that stage's rate.
        let mut frames = (self.pre_conv.state_len() + self.pre_transformer.reach()) as f64;
        let mut rate = 1usize;
        for (upsample, convnext) in &self.upsample_blocks {
            frames += upsample.kernel_size() as f64 / upsample.stride() as f64 / rate as f64;
            rate *= upsample.stride();
            frames += convnext.reach() as f64 / rate as f64;
        }
        frames += self.decoder_pre_conv.state_len() as f64 / rate as f64;
        for block in &self.decoder_blocks {
            let upsample = block.upsample();
            frames += upsample.kernel_size() as f64 / upsample.stride() as f64 / rate as f64;
            rate *= block.stride();
            frames += block.residual_reach() as f64 / rate as f64;
        }
        frames += self.decoder_final_conv.state_len() as f64 / rate as f64;
        frames.ceil() as usize
    }

    /// Code groups read from each frame.
    pub fn num_quantizers(&self) -> usize {
        self.quantizer.num_quantizers()
    }

    /// Fresh streaming state: all tails zero, transformer at position 0.
    pub fn new_stream(&self) -> CodecStreamState {
        CodecStreamState {
            pre_conv: self.pre_conv.new_state(),
            transformer: self.pre_transformer.new_state(STREAM_KV_CAPACITY),
            upsample: self.upsample_blocks.iter().map(|(_, block)| block.new_state()).collect(),
            vocoder_pre_conv: self.decoder_pre_conv.new_state(),
            blocks: self.decoder_blocks.iter().map(DecoderBlock::new_state).collect(),
            final_conv: self.decoder_final_conv.new_state(),
            frames: 0,
        }
    }

    /// Decode row-major frames of `groups` codes each.
    ///
    /// Returns `frames * samples_per_frame` samples in `[-1, 1]`.
    pub fn decode(&self, pool: &KernelPool, codes: &[u32], groups: usize) -> Vec<f32> {
        let frames = codes.len() / groups.max(1);
        let mut state = CodecStreamState {
            transformer: self.pre_transformer.new_state(frames.max(1)),
            ..self.new_stream()
        };
        self.forward(pool, codes, groups, &mut state)
    }

    /// Decode `codes` whose first `context_frames` frames were already
    /// emitted, returning only the samples of the frames after them.
    pub fn decode_with_context(&self, pool: &KernelPool, codes: &[u32], groups: usize, context_frames: usize) -> Vec<f32> {
        let wav = self.decode(pool, codes, groups);
        let skip = (context_frames * self.samples_per_frame()).min(wav.len());
        wav[skip..].to_vec()
    }

    /// Decode one frame on top of `state`, returning `samples_per_frame` samples.
    pub fn decode_step(&self, pool: &KernelPool, state: &mut CodecStreamState, frame: &[u32]) -> Vec<f32> {
        self.forward(pool, frame, frame.len(), state)
    }

    /// Decode `codes` both ways and compare the outputs sample by sample.
    pub fn verify_incremental(&self, pool: &KernelPool, codes: &[u32], groups: usize) -> IncrementalCheck {
        let batch = self.decode(pool, codes, groups);
        let mut state = self.new_stream();
        let mut incremental = Vec::with_capacity(batch.len());
        for frame in codes.chunks_exact(groups) {
            incremental.extend(self.decode_step(pool, &mut state, frame));
        }
        let n = batch.len().min(incremental.len());
        let (mut max, mut sum) = (0.0f32, 0.0f64);
        for (a, b) in batch[..n].iter().zip(&incremental[..n]) {
            let d = (a - b).abs();
            max = max.max(d);
            sum += d as f64;
        }
        let check = IncrementalCheck {
            batch_len: batch.len(),
            incremental_len: incremental.len(),
            max_abs_diff: max,
            mean_abs_diff: if n > 0 { (sum / n as f64) as f32 } else { 0.0 },
        };
        tracing::info!(
            frames = codes.len() / groups.max(1),
            batch_len = check.batch_len,
            incremental_len = check.incremental_len,
            max_abs_diff = check.max_abs_diff,
            mean_abs_diff = check.mean_abs_diff,
            passed = check.passed(),
            "incremental codec check"
        );
        check
    }

    fn forward(&self, pool: &KernelPool, codes: &[u32], groups: usize, state: &mut CodecStreamState) -> Vec<f32> {
        let frames = if groups == 0 { 0 } else { codes.len() / groups };
        if frames == 0 {
            return Vec::new();
        }
        let latent = self.config.latent_dim;

        let hidden = self.quantizer.decode(pool, &codes[..frames * groups], groups);
        debug_stage("after quantizer", &hidden);
        let hidden = self.pre_conv.forward_incremental(pool, &hidden, frames, &mut state.pre_conv);

        // Transformer rows are time-major.
        let rows = transpose(&hidden, latent, frames);
        let rows = self.pre_transformer.forward(pool, &mut state.transformer, &rows);
        let mut hidden = transpose(&rows, frames, latent);
        debug_stage("after transformer", &hidden);

        let mut length = frames;
        for ((upsample, convnext), tail) in self.upsample_blocks.iter().zip(state.upsample.iter_mut()) {
            let mut no_overlap = Vec::new();
            hidden = upsample.forward_incremental(pool, &hidden, length, &mut no_overlap);
            length *= upsample.stride();
            convnext.forward_incremental(pool, &mut hidden, length, tail);
        }

        hidden = self
            .decoder_pre_conv
            .forward_incremental(pool, &hidden, length, &mut state.vocoder_pre_conv);
        for (block, block_state) in self.decoder_blocks.iter().zip(state.blocks.iter_mut()) {
            hidden = block.forward_incremental(pool, &hidden, length, block_state);
            length *= block.stride();
        }
        debug_stage("after decoder blocks", &hidden);

        self.decoder_final_act.forward_inplace(&mut hidden, length);
        let mut wav = self
            .decoder_final_conv
            .forward_incremental(pool, &hidden, length, &mut state.final_conv);
        for s in wav.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }
        state.frames += frames;
        wav
    }
}

/// `[rows, cols]` → `[cols, rows]`.
fn transpose(x: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; x.len()];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = x[r * cols + c];
        }
    }
    out
}

fn debug_stage(stage: &str, x: &[f32]) {
    if !tracing::enabled!(tracing::Level::DEBUG) || x.is_empty() {
        return;
    }
    let (min, max) = x
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let mean = x.iter().map(|&v| v as f64).sum::<f64>() / x.len() as f64;
    tracing::debug!(
        stage,
        len = x.len(),
        min = format!("{min:.4}"),
        max = format!("{max:.4}"),
        mean = format!("{mean:.6}"),
        "decoder tensor"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};
    use std::collections::HashMap;

    fn tiny_config() -> CodecConfig {
        CodecConfig {
            codebook_size: 8,
            hidden_size: 8,
            latent_dim: 16,
            codebook_dim: 8,
            num_attention_heads: 2,
            num_key_value_heads: 1,
            sliding_window: 3,
            intermediate_size: 12,
            num_hidden_layers: 1,
            num_quantizers: 3,
            upsample_rates: vec![2, 2],
            upsampling_ratios: vec![2],
            decoder_dim: 8,
            ..CodecConfig::default()
        }
    }

    /// Write a random-but-deterministic decoder checkpoint for `config`.
    fn write_codec(dir: &std::path::Path, config: &CodecConfig) -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        let mut seed = 1usize;
        let mut add = |name: String, shape: &[usize], fill: Option<f32>| -> anyhow::Result<()> {
            let n: usize = shape.iter().product();
            seed += 1;
            let data: Vec<f32> = match fill {
                Some(v) => vec![v; n],
                None => (0..n)
                    .map(|i| ((((i + 31 * seed) * 2654435761) % 1000) as f32 / 1000.0 - 0.5) * 0.3)
                    .collect(),
            };
            tensors.insert(format!("decoder.{name}"), Tensor::from_vec(data, shape, &dev)?);
            Ok(())
        };

        let (cd, vq, size) = (config.codebook_dim, config.codebook_dim / 2, config.codebook_size);
        for (branch, n) in [("rvq_first", 1), ("rvq_rest", config.num_quantizers - 1)] {
            for q in 0..n {
                let cb = format!("quantizer.{branch}.vq.layers.{q}._codebook");
                add(format!("{cb}.cluster_usage"), &[size], Some(1.0))?;
                add(format!("{cb}.embedding_sum"), &[size, vq], None)?;
            }
            add(format!("quantizer.{branch}.output_proj.weight"), &[cd, vq, 1], None)?;
        }
        let (lat, hid, inter) = (config.latent_dim, config.hidden_size, config.intermediate_size);
        let (q_dim, kv_dim) = (
            config.num_attention_heads * config.head_dim(),
            config.num_key_value_heads * config.head_dim(),
        );
        add("pre_conv.conv.weight".into(), &[lat, cd, 3], None)?;
        add("pre_conv.conv.bias".into(), &[lat], None)?;
        add("pre_transformer.input_proj.weight".into(), &[hid, lat], None)?;
        add("pre_transformer.input_proj.bias".into(), &[hid], None)?;
        add("pre_transformer.output_proj.weight".into(), &[lat, hid], None)?;
        add("pre_transformer.output_proj.bias".into(), &[lat], None)?;
        add("pre_transformer.norm.weight".into(), &[hid], Some(1.0))?;
        for l in 0..config.num_hidden_layers {
            let p = format!("pre_transformer.layers.{l}");
            add(format!("{p}.input_layernorm.weight"), &[hid], Some(1.0))?;
            add(format!("{p}.post_attention_layernorm.weight"), &[hid], Some(1.0))?;
            add(format!("{p}.self_attn_layer_scale.scale"), &[hid], Some(0.1))?;
            add(format!("{p}.mlp_layer_scale.scale"), &[hid], Some(0.1))?;
            add(format!("{p}.self_attn.q_proj.weight"), &[q_dim, hid], None)?;
            add(format!("{p}.self_attn.k_proj.weight"), &[kv_dim, hid], None)?;
            add(format!("{p}.self_attn.v_proj.weight"), &[kv_dim, hid], None)?;
            add(format!("{p}.self_attn.o_proj.weight"), &[hid, q_dim], None)?;
            add(format!("{p}.mlp.gate_proj.weight"), &[inter, hid], None)?;
            add(format!("{p}.mlp.up_proj.weight"), &[inter, hid], None)?;
            add(format!("{p}.mlp.down_proj.weight"), &[hid, inter], None)?;
        }
        for (s, &ratio) in config.upsampling_ratios.iter().enumerate() {
            add(format!("upsample.{s}.0.conv.weight"), &[lat, lat, ratio], None)?;
            add(format!("upsample.{s}.0.conv.bias"), &[lat], None)?;
            let p = format!("upsample.{s}.1");
            add(format!("{p}.dwconv.conv.weight"), &[lat, 1, 7], None)?;
            add(format!("{p}.dwconv.conv.bias"), &[lat], None)?;
            add(format!("{p}.norm.weight"), &[lat], Some(1.0))?;
            add(format!("{p}.norm.bias"), &[lat], Some(0.0))?;
            add(format!("{p}.pwconv1.weight"), &[4 * lat, lat], None)?;
            add(format!("{p}.pwconv1.bias"), &[4 * lat], None)?;
            add(format!("{p}.pwconv2.weight"), &[lat, 4 * lat], None)?;
            add(format!("{p}.pwconv2.bias"), &[lat], None)?;
            add(format!("{p}.gamma"), &[lat], Some(0.5))?;
        }
        let dd = config.decoder_dim;
        add("decoder.0.conv.weight".into(), &[dd, lat, 7], None)?;
        add("decoder.0.conv.bias".into(), &[dd], None)?;
        for (b, &rate) in config.upsample_rates.iter().enumerate() {
            let (din, dout) = (dd >> b, dd >> (b + 1));
            let p = format!("decoder.{}.block", b + 1);
            add(format!("{p}.0.alpha"), &[din], Some(0.0))?;
            add(format!("{p}.0.beta"), &[din], Some(0.0))?;
            add(format!("{p}.1.conv.weight"), &[din, dout, 2 * rate], None)?;
            add(format!("{p}.1.conv.bias"), &[dout], None)?;
            for r in 0..3 {
                let u = format!("{p}.{}", r + 2);
                for act in ["act1", "act2"] {
                    add(format!("{u}.{act}.alpha"), &[dout], Some(0.0))?;
                    add(format!("{u}.{act}.beta"), &[dout], Some(0.0))?;
                }
                add(format!("{u}.conv1.conv.weight"), &[dout, dout, 7], None)?;
                add(format!("{u}.conv1.conv.bias"), &[dout], None)?;
                add(format!("{u}.conv2.conv.weight"), &[dout, dout, 1], None)?;
                add(format!("{u}.conv2.conv.bias"), &[dout], None)?;
            }
        }
        let blocks = config.upsample_rates.len();
        let out_dim = dd >> blocks;
        add(format!("decoder.{}.alpha", blocks + 1), &[out_dim], Some(0.0))?;
        add(format!("decoder.{}.beta", blocks + 1), &[out_dim], Some(0.0))?;
        add(format!("decoder.{}.conv.weight", blocks + 2), &[1, out_dim, 7], None)?;
        add(format!("decoder.{}.conv.bias", blocks + 2), &[1], Some(0.0))?;

        candle_core::safetensors::save(&tensors, dir.join("model.safetensors"))?;
        Ok(())
    }

    fn load_tiny() -> anyhow::Result<(tempfile::TempDir, CodecDecoder)> {
        let dir = tempfile::tempdir()?;
        let config = tiny_config();
        write_codec(dir.path(), &config)?;
        let store = WeightStore::open(dir.path())?;
        let decoder = CodecDecoder::load(&store, &config)?;
        Ok((dir, decoder))
    }

    fn codes(frames: usize, groups: usize) -> Vec<u32> {
        (0..frames * groups).map(|i| ((i * 5 + 3) % 11) as u32).collect()
    }

    #[test]
    fn test_batch_length_and_range() -> anyhow::Result<()> {
        let (_dir, decoder) = load_tiny()?;
        let pool = KernelPool::inline();
        assert_eq!(decoder.samples_per_frame(), 8);
        assert_eq!(decoder.num_quantizers(), 3);
        let wav = decoder.decode(&pool, &codes(6, 4), 4);
        assert_eq!(wav.len(), 6 * 8);
        assert!(wav.iter().all(|s| (-1.0..=1.0).contains(s)));
        assert!(wav.iter().any(|&s| s != 0.0));
        assert!(decoder.decode(&pool, &[], 4).is_empty());
        Ok(())
    }

    #[test]
    fn test_incremental_matches_batch() -> anyhow::Result<()> {
        let (_dir, decoder) = load_tiny()?;
        let pool = KernelPool::inline();
        let check = decoder.verify_incremental(&pool, &codes(9, 3), 3);
        assert_eq!(check.batch_len, check.incremental_len);
        assert!(check.max_abs_diff < 1e-3, "{check:?}");
        Ok(())
    }

    #[test]
    fn test_stream_state_tracks_frames() -> anyhow::Result<()> {
        let (_dir, decoder) = load_tiny()?;
        let pool = KernelPool::inline();
        let all = codes(4, 3);
        let mut state = decoder.new_stream();
        for frame in all.chunks(3) {
            assert_eq!(decoder.decode_step(&pool, &mut state, frame).len(), 8);
        }
        assert_eq!(state.frames(), 4);
        Ok(())
    }

    #[test]
    fn test_receptive_field_of_tiny_decoder() -> anyhow::Result<()> {
        let (_dir, decoder) = load_tiny()?;
        // pre-conv 2 + attention 2, upsample 1 + ConvNeXt 3, vocoder pre-conv 3,
        // blocks 1 + 19.5 and 0.5 + 9.75, final conv 0.75
        assert_eq!(decoder.receptive_field_frames(), 43);
        Ok(())
    }

    #[test]
    fn test_context_decode_matches_batch() -> anyhow::Result<()> {
        let (_dir, decoder) = load_tiny()?;
        let pool = KernelPool::inline();
        let context = decoder.receptive_field_frames();
        let (frames, start) = (56, 50);
        let all = codes(frames, 3);
        let full = decoder.decode(&pool, &all, 3);

        // Frames 50..56 decoded from a window that starts well after frame 0.
        let window = &all[(start - context) * 3..];
        let tail = decoder.decode_with_context(&pool, window, 3, context);
        assert_eq!(tail.len(), (frames - start) * 8);
        let max_diff = tail
            .iter()
            .zip(&full[start * 8..])
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(max_diff < 1e-3, "max diff {max_diff}");
        Ok(())
    }

    #[test]
    fn test_short_context_truncates_history() -> anyhow::Result<()> {
        let (_dir, decoder) = load_tiny()?;
        let pool = KernelPool::inline();
        let all = codes(12, 3);
        let full = decoder.decode(&pool, &all, 3);
        let tail = decoder.decode_with_context(&pool, &all[6 * 3..], 3, 2);
        assert_eq!(tail.len(), 4 * 8);
        assert!(tail.iter().all(|s| (-1.0..=1.0).contains(s)));
        // Two frames of context is far below the receptive field.
        assert_ne!(tail.as_slice(), &full[8 * 8..]);
        Ok(())
    }
}
