//! The engine context: loading, generation and codec rendering.
//!
//! A [`Model`] owns everything one generation needs: configs, the mapped
//! weight store, quantized matrices, KV caches, scratch buffers, the RNG and
//! the kernel pool. Generation calls take `&mut self`, so one context runs one
//! generation at a time. Separate contexts are fully independent.

pub mod generate;
pub mod loader;
pub mod options;
pub mod prompt;

use std::ops::ControlFlow;
use std::path::Path;

use crate::audio::decoder::IncrementalCheck;
use crate::audio::{CodecConfig, CodecDecoder};
use crate::config::{Config, GenerationConfig};
use crate::error::{GenerateError, LoadError};
use crate::io::{ModelPaths, WeightStore};
use crate::nn::timing::{PerfStats, StopReason, Stopwatch};
use crate::quant::KernelPool;

pub use generate::CodeFrames;
use generate::{ChunkEmitter, FrameRun, Runtime, Weights, run_frames};
pub use options::{GenerateOptions, LoadOptions, StreamDecode};

/// How a streaming generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Generation ran to EOS or the token budget and every chunk was delivered
    Completed,
    /// The audio callback asked to stop
    Aborted,
}

type ProgressCallback = Box<dyn FnMut(usize, usize) + Send>;

/// A loaded Qwen3-TTS engine context.
pub struct Model {
    config: Config,
    codec_config: CodecConfig,
    paths: ModelPaths,
    weights: Weights,
    codec: Option<CodecDecoder>,
    pool: KernelPool,
    options: GenerateOptions,
    runtime: Runtime,
    last_perf: PerfStats,
    progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("root", &self.paths.root)
            .field("codec_loaded", &self.codec.is_some())
            .field("threads", &self.pool.threads())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn read_file(path: &Path) -> Result<String, LoadError> {
    std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_error(path: &Path) -> impl FnOnce(serde_json::Error) -> LoadError + '_ {
    move |source| LoadError::ConfigParse {
        path: path.to_path_buf(),
        source,
    }
}

fn load_generation_config(paths: &ModelPaths) -> Result<GenerationConfig, LoadError> {
    let path = &paths.generation_config;
    if !path.is_file() {
        tracing::debug!(path = %path.display(), "no generation config, using built-in defaults");
        return Ok(GenerationConfig::default());
    }
    GenerationConfig::from_json(&read_file(path)?).map_err(parse_error(path))
}

fn load_codec_config(paths: &ModelPaths) -> Result<CodecConfig, LoadError> {
    let path = &paths.codec_config;
    if !path.is_file() {
        tracing::warn!(path = %path.display(), "no codec config, using built-in defaults");
        return Ok(CodecConfig::default());
    }
    CodecConfig::from_json(&read_file(path)?).map_err(parse_error(path))
}

/// Load the codec into `slot` unless it is already there.
fn ensure_codec<'a>(
    slot: &'a mut Option<CodecDecoder>,
    paths: &ModelPaths,
    config: &CodecConfig,
) -> Result<&'a CodecDecoder, LoadError> {
    match slot {
        Some(codec) => Ok(codec),
        None => {
            let store = WeightStore::open(&paths.codec_dir)?;
            let codec = CodecDecoder::load(&store, config)?;
            tracing::info!(dir = %paths.codec_dir.display(), "codec decoder loaded");
            Ok(slot.insert(codec))
        }
    }
}

impl Model {
    /// Load a model directory.
    ///
    /// Reads `config.json`, the optional `generation_config.json` and
    /// `speech_tokenizer/config.json`, maps the weights and builds the
    /// quantized matrices (from the cache when it is valid). The codec
    /// weights are loaded as well when present; if they are not, loading
    /// still succeeds and rendering audio fails until they appear.
    pub fn load(path: impl AsRef<Path>, options: &LoadOptions) -> Result<Self, LoadError> {
        let clock = Stopwatch::start();
        let paths = ModelPaths::new(path, options.cache_dir.as_deref());
        let config = Config::from_json(&read_file(&paths.config)?).map_err(parse_error(&paths.config))?;
        config.validate()?;
        let codec_config = load_codec_config(&paths)?;
        config.validate_codec(&codec_config)?;
        let generation = load_generation_config(&paths)?;

        let t = &config.talker_config;
        tracing::info!(
            root = %paths.root.display(),
            model_type = config.tts_model_type.as_deref().unwrap_or("unknown"),
            talker_layers = t.num_hidden_layers,
            predictor_layers = t.code_predictor_config.num_hidden_layers,
            groups = t.num_code_groups,
            speakers = t.spk_id.len(),
            languages = t.codec_language_id.len(),
            "loading model"
        );

        let pool = KernelPool::new(options.threads)?;
        let store = WeightStore::open(&paths.root)?;
        let (talker, code_predictor) = loader::load_weights(&store, &pool, &config, &paths, options)?;
        let weights = Weights {
            store,
            talker,
            code_predictor,
        };
        let runtime = Runtime::new(&weights, &config);

        let mut codec = None;
        if let Err(err) = ensure_codec(&mut codec, &paths, &codec_config) {
            tracing::warn!(%err, "codec decoder unavailable, audio rendering will retry on demand");
        }

        tracing::info!(
            elapsed_ms = clock.elapsed().as_millis() as u64,
            threads = pool.threads(),
            codec = codec.is_some(),
            "model loaded"
        );
        Ok(Self {
            config,
            codec_config,
            paths,
            weights,
            codec,
            pool,
            options: GenerateOptions::from(&generation),
            runtime,
            last_perf: PerfStats::default(),
            progress: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Output sample rate of the codec.
    pub fn sample_rate(&self) -> u32 {
        self.codec_config.sample_rate
    }

    /// Code groups per frame.
    pub fn num_code_groups(&self) -> usize {
        self.weights.code_predictor.num_groups()
    }

    /// Configured speaker names, in file order.
    pub fn speakers(&self) -> Vec<&str> {
        self.config.talker_config.spk_id.names().collect()
    }

    /// Configured language names, in file order.
    pub fn languages(&self) -> Vec<&str> {
        self.config.talker_config.codec_language_id.names().collect()
    }

    /// Options used by [`Self::generate`] and [`Self::generate_stream`].
    /// Initialized from `generation_config.json`.
    pub fn options(&self) -> &GenerateOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: GenerateOptions) {
        self.options = options;
    }

    /// Timing of the most recent generation.
    pub fn last_perf(&self) -> &PerfStats {
        &self.last_perf
    }

    /// Report `(frames_done, max_frames)` after every generated frame.
    /// Runs on the generation thread and must not block.
    pub fn set_progress_callback(&mut self, callback: impl FnMut(usize, usize) + Send + 'static) {
        self.progress = Some(Box::new(callback));
    }

    pub fn clear_progress_callback(&mut self) {
        self.progress = None;
    }

    /// The codec decoder, if loaded.
    pub fn codec(&self) -> Option<&CodecDecoder> {
        self.codec.as_ref()
    }

    /// Load the codec decoder if it is not loaded yet.
    pub fn ensure_codec_loaded(&mut self) -> Result<(), GenerateError> {
        ensure_codec(&mut self.codec, &self.paths, &self.codec_config)
            .map(|_| ())
            .map_err(GenerateError::CodecLoad)
    }

    /// Talker KV positions currently allocated.
    pub fn talker_kv_capacity(&self) -> usize {
        self.runtime.talker_capacity()
    }

    fn frames(
        &mut self,
        tokens: &[u32],
        speaker: Option<&str>,
        language: Option<&str>,
        options: &GenerateOptions,
        on_frame: impl FnMut(&CodeFrames) -> ControlFlow<()>,
    ) -> Result<FrameRun, GenerateError> {
        run_frames(
            &self.weights,
            &self.config,
            &self.pool,
            &mut self.runtime,
            tokens,
            speaker,
            language,
            options,
            self.progress.as_deref_mut(),
            on_frame,
        )
    }

    fn record(&mut self, run: &FrameRun, codec_ms: f64, total: Stopwatch) {
        self.last_perf = PerfStats {
            prefill_ms: run.prefill_ms,
            talker_ms: run.talker_ms,
            subtalker_ms: run.subtalker_ms,
            codec_ms,
            total_ms: total.elapsed_ms(),
            frames: run.frames.len(),
            stop_reason: run.stop,
        };
        self.last_perf.log();
    }

    /// Synthesize `tokens` with the context's options.
    ///
    /// `tokens` is the pre-tokenized chat template
    /// `[im_start, assistant, \n, text..., im_end, \n, im_start, assistant, \n]`.
    /// Unknown speaker or language names are ignored with a warning.
    pub fn generate(
        &mut self,
        tokens: &[u32],
        speaker: Option<&str>,
        language: Option<&str>,
    ) -> Result<Vec<f32>, GenerateError> {
        let options = self.options.clone();
        self.generate_with(tokens, speaker, language, &options)
    }

    /// Like [`Self::generate`] with explicit options.
    ///
    /// When the codec cannot be loaded the generated frames are returned
    /// inside [`GenerateError::CodecUnavailable`].
    pub fn generate_with(
        &mut self,
        tokens: &[u32],
        speaker: Option<&str>,
        language: Option<&str>,
        options: &GenerateOptions,
    ) -> Result<Vec<f32>, GenerateError> {
        let total = Stopwatch::start();
        let run = self.frames(tokens, speaker, language, options, |_| ControlFlow::Continue(()))?;
        if run.frames.is_empty() {
            self.record(&run, 0.0, total);
            return Err(GenerateError::NoFrames);
        }

        let codec = match ensure_codec(&mut self.codec, &self.paths, &self.codec_config) {
            Ok(codec) => codec,
            Err(err) => {
                tracing::warn!(%err, frames = run.frames.len(), "codec unavailable after generation");
                self.record(&run, 0.0, total);
                return Err(GenerateError::CodecUnavailable {
                    reason: err.to_string(),
                    frames: run.frames,
                });
            }
        };
        let clock = Stopwatch::start();
        let audio = codec.decode(&self.pool, &run.frames.codes, run.frames.groups);
        let codec_ms = clock.elapsed_ms();
        self.record(&run, codec_ms, total);
        Ok(audio)
    }

    /// Generate codec frames without rendering audio.
    pub fn generate_codes(
        &mut self,
        tokens: &[u32],
        speaker: Option<&str>,
        language: Option<&str>,
        options: &GenerateOptions,
    ) -> Result<CodeFrames, GenerateError> {
        let total = Stopwatch::start();
        let run = self.frames(tokens, speaker, language, options, |_| ControlFlow::Continue(()))?;
        self.record(&run, 0.0, total);
        if run.frames.is_empty() {
            return Err(GenerateError::NoFrames);
        }
        Ok(run.frames)
    }

    /// Render frames from [`Self::generate_codes`] or from a
    /// [`GenerateError::CodecUnavailable`], loading the codec if needed.
    pub fn decode_codes(&mut self, frames: &CodeFrames) -> Result<Vec<f32>, GenerateError> {
        let codec = ensure_codec(&mut self.codec, &self.paths, &self.codec_config).map_err(GenerateError::CodecLoad)?;
        if frames.groups < codec.num_quantizers() {
            return Err(GenerateError::FrameWidth {
                got: frames.groups,
                expected: codec.num_quantizers(),
            });
        }
        Ok(codec.decode(&self.pool, &frames.codes, frames.groups))
    }

    /// Decode `frames` in one batch and frame by frame, and compare the two.
    pub fn verify_codec(&mut self, frames: &CodeFrames) -> Result<IncrementalCheck, GenerateError> {
        let codec = ensure_codec(&mut self.codec, &self.paths, &self.codec_config).map_err(GenerateError::CodecLoad)?;
        let check = codec.verify_incremental(&self.pool, &frames.codes, frames.groups);
        tracing::info!(
            frames = frames.len(),
            max_abs_diff = check.max_abs_diff,
            mean_abs_diff = check.mean_abs_diff,
            passed = check.passed(),
            "incremental codec check"
        );
        Ok(check)
    }

    /// Streaming synthesis with the context's options.
    ///
    /// `callback` receives audio every `chunk` frames (`0`: once at the end)
    /// and returns [`ControlFlow::Break`] to stop generation early. Stopping
    /// is reported as [`StreamOutcome::Aborted`], not as an error.
    pub fn generate_stream<F>(
        &mut self,
        tokens: &[u32],
        speaker: Option<&str>,
        language: Option<&str>,
        chunk: usize,
        callback: F,
    ) -> Result<StreamOutcome, GenerateError>
    where
        F: FnMut(&[f32]) -> ControlFlow<()>,
    {
        let options = self.options.clone();
        self.generate_stream_with(tokens, speaker, language, chunk, &options, callback)
    }

    /// Like [`Self::generate_stream`] with explicit options.
    ///
    /// The codec must be loadable before generation starts; failing to load
    /// it is an error here.
    pub fn generate_stream_with<F>(
        &mut self,
        tokens: &[u32],
        speaker: Option<&str>,
        language: Option<&str>,
        chunk: usize,
        options: &GenerateOptions,
        callback: F,
    ) -> Result<StreamOutcome, GenerateError>
    where
        F: FnMut(&[f32]) -> ControlFlow<()>,
    {
        let total = Stopwatch::start();
        prompt::validate_tokens(tokens, self.weights.talker.text_vocab_size())?;
        let codec = ensure_codec(&mut self.codec, &self.paths, &self.codec_config).map_err(GenerateError::CodecLoad)?;
        let context = options.overlap_context.unwrap_or(chunk);
        let mut emitter = ChunkEmitter::new(codec, &self.pool, chunk, context, options.stream_decode, callback);

        let mut run = run_frames(
            &self.weights,
            &self.config,
            &self.pool,
            &mut self.runtime,
            tokens,
            speaker,
            language,
            options,
            self.progress.as_deref_mut(),
            |frames| emitter.on_frame(frames),
        )?;

        if run.stop != StopReason::Aborted && emitter.finish(&run.frames).is_break() {
            run.stop = StopReason::Aborted;
        }
        let outcome = match run.stop {
            StopReason::Aborted => StreamOutcome::Aborted,
            _ => StreamOutcome::Completed,
        };
        tracing::debug!(
            chunks = emitter.chunks,
            samples = emitter.samples,
            mode = ?options.stream_decode,
            outcome = ?outcome,
            "stream finished"
        );
        let codec_ms = emitter.codec_ms;
        drop(emitter);
        self.record(&run, codec_ms, total);
        Ok(outcome)
    }
}
