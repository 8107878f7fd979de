//! Load-time and generation-time knobs.

use std::path::PathBuf;

use crate::config::GenerationConfig;
use crate::nn::sampling::SamplingParams;

/// Options for [`super::Model::load`].
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Directory for the quantized cache (default: the model directory)
    pub cache_dir: Option<PathBuf>,
    /// Read and write the quantized cache (default: true)
    pub use_cache: bool,
    /// Kernel worker threads; 0 or 1 runs kernels on the calling thread
    pub threads: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            cache_dir: None,
            use_cache: true,
            threads: default_threads(),
        }
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get().min(4))
}

/// How streaming generation renders audio chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamDecode {
    /// Re-decode each chunk with the previous chunk's frames as left context
    #[default]
    Overlap,
    /// Thread one codec stream state through every frame
    Incremental,
}

/// Sampling and stopping parameters for one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateOptions {
    pub do_sample: bool,
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub subtalker_do_sample: bool,
    pub subtalker_temperature: f32,
    pub subtalker_top_k: usize,
    pub subtalker_top_p: f32,
    /// Upper bound on generated frames when not in fixed-length mode
    pub max_new_tokens: usize,
    /// When non-zero, generate exactly this many frames; EOS is resampled away
    pub fixed_codec_tokens: usize,
    /// Seed applied at the start of every generation
    pub seed: u64,
    pub stream_decode: StreamDecode,
    /// Left-context frames re-decoded with each overlap chunk; `None` uses
    /// the chunk size. Below the codec's receptive field the chunk samples
    /// differ slightly from a batch decode.
    pub overlap_context: Option<usize>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self::from(&GenerationConfig::default())
    }
}

impl From<&GenerationConfig> for GenerateOptions {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            do_sample: config.do_sample,
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            repetition_penalty: config.repetition_penalty,
            subtalker_do_sample: config.subtalker_do_sample,
            subtalker_temperature: config.subtalker_temperature,
            subtalker_top_k: config.subtalker_top_k,
            subtalker_top_p: config.subtalker_top_p,
            max_new_tokens: config.max_new_tokens,
            fixed_codec_tokens: 0,
            seed: 42,
            stream_decode: StreamDecode::default(),
            overlap_context: None,
        }
    }
}

impl GenerateOptions {
    /// Frames the talker loop may produce.
    pub fn token_budget(&self) -> usize {
        if self.fixed_codec_tokens > 0 {
            self.fixed_codec_tokens
        } else {
            self.max_new_tokens
        }
    }

    pub fn talker_sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            do_sample: self.do_sample,
        }
    }

    pub fn subtalker_sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.subtalker_temperature,
            top_k: self.subtalker_top_k,
            top_p: self.subtalker_top_p,
            do_sample: self.subtalker_do_sample,
        }
    }
}
