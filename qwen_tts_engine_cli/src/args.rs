use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use qwen_tts_engine::model::{GenerateOptions, LoadOptions, StreamDecode};

/// Qwen3-TTS on-device inference engine
///
/// Synthesize speech from a pre-tokenized chat template with a quantized
/// CPU runtime. Token ids come from the Qwen tokenizer; this tool does not
/// tokenize text itself.
#[derive(Parser, Debug)]
#[command(name = "qwen-tts-engine")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to a local model directory
    #[arg(short = 'p', long)]
    pub model_path: PathBuf,

    /// Comma or whitespace separated token ids of the chat template
    #[arg(short, long, conflicts_with = "tokens_file")]
    pub tokens: Option<String>,

    /// File holding the token ids (same format as --tokens)
    #[arg(long)]
    pub tokens_file: Option<PathBuf>,

    /// Speaker name (case-insensitive)
    #[arg(short, long)]
    pub speaker: Option<String>,

    /// Language name, or "auto"
    #[arg(short, long, default_value = "auto")]
    pub language: String,

    /// Output WAV file path
    #[arg(short, long, default_value = "output.wav")]
    pub output: PathBuf,

    /// Maximum number of frames to generate
    #[arg(long)]
    pub max_tokens: Option<usize>,

    /// Generate exactly this many frames, ignoring end-of-sequence
    #[arg(long)]
    pub fixed_tokens: Option<usize>,

    /// Sampling temperature (higher = more random)
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Top-k sampling parameter
    #[arg(long)]
    pub top_k: Option<usize>,

    /// Top-p (nucleus) sampling parameter
    #[arg(long)]
    pub top_p: Option<f32>,

    /// Repetition penalty
    #[arg(long)]
    pub repetition_penalty: Option<f32>,

    /// Random seed for reproducible generation
    #[arg(long)]
    pub seed: Option<u64>,

    /// Use greedy sampling for deterministic output
    #[arg(long)]
    pub greedy: bool,

    /// Subtalker sampling temperature
    #[arg(long)]
    pub subtalker_temperature: Option<f32>,

    /// Subtalker top-k sampling parameter
    #[arg(long)]
    pub subtalker_top_k: Option<usize>,

    /// Subtalker top-p sampling parameter
    #[arg(long)]
    pub subtalker_top_p: Option<f32>,

    /// Disable sampling for subtalker
    #[arg(long)]
    pub no_subtalker_sample: bool,

    /// Directory for the quantized weight cache (default: the model directory)
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Neither read nor write the quantized weight cache
    #[arg(long)]
    pub no_cache: bool,

    /// Kernel worker threads
    #[arg(long)]
    pub threads: Option<usize>,

    /// Stream audio in chunks of this many frames (0 = one chunk at the end)
    #[arg(long)]
    pub stream_chunk: Option<usize>,

    /// How streamed chunks are decoded
    #[arg(long, value_enum, default_value_t = StreamMode::Overlap)]
    pub stream_mode: StreamMode,

    /// Frames of left context re-decoded with each overlap chunk (default: the chunk size)
    #[arg(long)]
    pub overlap_context: Option<usize>,

    /// Print the configured speakers and languages and exit
    #[arg(long)]
    pub list_speakers: bool,

    /// Compare batch and incremental codec decoding and exit
    #[arg(long)]
    pub verify_codec: bool,

    /// Frames decoded by --verify-codec
    #[arg(long, default_value = "24")]
    pub verify_frames: usize,

    /// Enable tracing output (debug logs). Use RUST_LOG env var to filter levels.
    #[arg(long)]
    pub tracing: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Re-decode each chunk with the previous chunk as left context
    Overlap,
    /// Carry codec state from frame to frame
    Incremental,
}

impl From<StreamMode> for StreamDecode {
    fn from(mode: StreamMode) -> Self {
        match mode {
            StreamMode::Overlap => StreamDecode::Overlap,
            StreamMode::Incremental => StreamDecode::Incremental,
        }
    }
}

/// Parse token ids separated by commas and/or whitespace.
pub fn parse_token_list(text: &str) -> Result<Vec<u32>> {
    text.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .with_context(|| format!("Invalid token id `{s}`"))
        })
        .collect()
}

fn read_token_file(path: &Path) -> Result<Vec<u32>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read token file {}", path.display()))?;
    parse_token_list(&text)
}

impl Cli {
    pub fn load_options(&self) -> LoadOptions {
        let defaults = LoadOptions::default();
        LoadOptions {
            cache_dir: self.cache_dir.clone(),
            use_cache: !self.no_cache,
            threads: self.threads.unwrap_or(defaults.threads),
        }
    }

    /// Apply command-line overrides on top of the model's defaults.
    pub fn generate_options(&self, mut options: GenerateOptions) -> GenerateOptions {
        if let Some(v) = self.temperature {
            options.temperature = v;
        }
        if let Some(v) = self.top_k {
            options.top_k = v;
        }
        if let Some(v) = self.top_p {
            options.top_p = v;
        }
        if let Some(v) = self.repetition_penalty {
            options.repetition_penalty = v;
        }
        if let Some(v) = self.subtalker_temperature {
            options.subtalker_temperature = v;
        }
        if let Some(v) = self.subtalker_top_k {
            options.subtalker_top_k = v;
        }
        if let Some(v) = self.subtalker_top_p {
            options.subtalker_top_p = v;
        }
        if let Some(v) = self.max_tokens {
            options.max_new_tokens = v;
        }
        if let Some(v) = self.fixed_tokens {
            options.fixed_codec_tokens = v;
        }
        if let Some(v) = self.seed {
            options.seed = v;
        }
        if self.greedy {
            options.do_sample = false;
            options.subtalker_do_sample = false;
        }
        if self.no_subtalker_sample {
            options.subtalker_do_sample = false;
        }
        options.stream_decode = self.stream_mode.into();
        if self.overlap_context.is_some() {
            options.overlap_context = self.overlap_context;
        }
        options
    }

    pub fn read_tokens(&self) -> Result<Vec<u32>> {
        let tokens = match (&self.tokens, &self.tokens_file) {
            (Some(list), _) => parse_token_list(list)?,
            (None, Some(path)) => read_token_file(path)?,
            (None, None) => bail!("Either --tokens or --tokens-file is required"),
        };
        if tokens.is_empty() {
            bail!("No token ids given");
        }
        Ok(tokens)
    }

    /// `None` when the language is "auto" or empty.
    pub fn language(&self) -> Option<&str> {
        let lang = self.language.trim();
        (!lang.is_empty() && !lang.eq_ignore_ascii_case("auto")).then_some(lang)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_token_list() {
        assert_eq!(parse_token_list("1, 2,3\n4").unwrap(), vec![1, 2, 3, 4]);
        assert!(parse_token_list("1,x").is_err());
        assert!(parse_token_list(" ").unwrap().is_empty());
    }

    #[test]
    fn test_overrides_apply_on_top_of_defaults() {
        let cli = Cli::try_parse_from([
            "qwen-tts-engine",
            "-p",
            "/models/tts",
            "--tokens",
            "1,2",
            "--greedy",
            "--top-k",
            "7",
            "--fixed-tokens",
            "30",
            "--stream-mode",
            "incremental",
            "--overlap-context",
            "48",
        ])
        .unwrap();
        let options = cli.generate_options(GenerateOptions::default());
        assert!(!options.do_sample);
        assert!(!options.subtalker_do_sample);
        assert_eq!(options.top_k, 7);
        assert_eq!(options.token_budget(), 30);
        assert_eq!(options.stream_decode, StreamDecode::Incremental);
        assert_eq!(options.overlap_context, Some(48));
        assert_eq!(options.temperature, GenerateOptions::default().temperature);
        assert_eq!(cli.language(), None);
    }

    #[test]
    fn test_tokens_and_file_conflict() {
        let parsed = Cli::try_parse_from([
            "qwen-tts-engine",
            "-p",
            "/m",
            "--tokens",
            "1",
            "--tokens-file",
            "t.txt",
        ]);
        assert!(parsed.is_err());
    }
}
