//! The talker / code-predictor frame loop and the streaming chunk emitter.

use std::ops::ControlFlow;

use crate::audio::{CodecDecoder, CodecStreamState};
use crate::config::Config;
use crate::error::GenerateError;
use crate::io::WeightStore;
use crate::model::options::{GenerateOptions, StreamDecode};
use crate::model::prompt::{self, resolve_name};
use crate::nn::code_predictor::PredictorScratch;
use crate::nn::mt_rng::MtRng;
use crate::nn::rope::RopeTable;
use crate::nn::sampling::{MASKED_LOGIT, Sampler, apply_repetition_penalty, suppress_range};
use crate::nn::talker::TalkerScratch;
use crate::nn::timing::{StopReason, Stopwatch};
use crate::nn::{CodePredictor, Talker, TransformerState};
use crate::quant::KernelPool;

/// Codes at the top of the talker vocabulary that are never valid output,
/// apart from the end-of-sequence code.
const RESERVED_CODES: usize = 1024;

/// Talker positions reserved beyond the prompt on first use.
const TALKER_KV_HEADROOM: usize = 4096;
const TALKER_KV_GROWTH: usize = 2048;

/// Generated codec frames, row-major `[frames, groups]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeFrames {
    pub groups: usize,
    pub codes: Vec<u32>,
}

impl CodeFrames {
    pub fn new(groups: usize) -> Self {
        Self {
            groups,
            codes: Vec::new(),
        }
    }

    /// Wrap row-major codes. Trailing codes that do not fill a frame are dropped.
    pub fn from_codes(groups: usize, mut codes: Vec<u32>) -> Self {
        codes.truncate(codes.len() / groups.max(1) * groups);
        Self { groups, codes }
    }

    pub fn len(&self) -> usize {
        self.codes.len() / self.groups.max(1)
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn frame(&self, index: usize) -> &[u32] {
        &self.codes[index * self.groups..(index + 1) * self.groups]
    }

    /// Codes of frames `[start, end)`.
    pub fn range(&self, start: usize, end: usize) -> &[u32] {
        &self.codes[start * self.groups..end * self.groups]
    }

    /// Group-0 codes, one per frame.
    pub fn first_codes(&self) -> impl Iterator<Item = u32> + '_ {
        self.codes.iter().step_by(self.groups.max(1)).copied()
    }

    fn push(&mut self, frame: &[u32]) {
        debug_assert_eq!(frame.len(), self.groups);
        self.codes.extend_from_slice(frame);
    }
}

/// Weights shared by every generation on one context.
pub(crate) struct Weights {
    pub store: WeightStore,
    pub talker: Talker,
    pub code_predictor: CodePredictor,
}

/// Per-context mutable state, reused across generations.
pub(crate) struct Runtime {
    talker_state: Option<TransformerState>,
    predictor_state: TransformerState,
    sampler: Sampler,
    rng: MtRng,
    talker_scratch: TalkerScratch,
    predictor_scratch: PredictorScratch,
    logits: Vec<f32>,
    row: Vec<f32>,
}

impl Runtime {
    pub fn new(weights: &Weights, config: &Config) -> Self {
        let t = &config.talker_config;
        let groups = t.num_code_groups;
        let predictor_state = TransformerState::new(
            &weights.code_predictor.transformer,
            RopeTable::new(t.code_predictor_config.head_dim, t.rope_theta),
            groups + 1,
            groups,
        );
        Self {
            talker_state: None,
            predictor_state,
            sampler: Sampler::new(),
            rng: MtRng::new(0),
            talker_scratch: TalkerScratch::default(),
            predictor_scratch: PredictorScratch::default(),
            logits: Vec::new(),
            row: Vec::new(),
        }
    }

    /// Talker positions currently allocated, 0 before the first generation.
    pub fn talker_capacity(&self) -> usize {
        self.talker_state.as_ref().map_or(0, |s| s.cache.capacity())
    }
}

fn talker_state<'a>(
    slot: &'a mut Option<TransformerState>,
    talker: &Talker,
    config: &Config,
    prefill_len: usize,
) -> &'a mut TransformerState {
    slot.get_or_insert_with(|| {
        let t = &config.talker_config;
        let rope = match config.talker_mrope() {
            Some(sections) => RopeTable::multimodal(t.head_dim(), t.rope_theta, sections),
            None => RopeTable::new(t.head_dim(), t.rope_theta),
        };
        let capacity = prefill_len + TALKER_KV_HEADROOM;
        tracing::debug!(capacity, growth = TALKER_KV_GROWTH, "allocating talker KV cache");
        TransformerState::new(&talker.transformer, rope, capacity, TALKER_KV_GROWTH)
    })
}

/// Result of one frame loop.
#[derive(Debug)]
pub(crate) struct FrameRun {
    pub frames: CodeFrames,
    pub stop: StopReason,
    pub prefill_ms: f64,
    pub talker_ms: f64,
    pub subtalker_ms: f64,
}

pub(crate) type ProgressFn<'a> = &'a mut (dyn FnMut(usize, usize) + Send + 'static);

/// Run prefill and the talker / code-predictor loop.
///
/// `on_frame` sees every frame produced so far after each accepted frame;
/// breaking stops the loop with [`StopReason::Aborted`].
#[allow(clippy::too_many_arguments)]
pub(crate) fn run_frames(
    weights: &Weights,
    config: &Config,
    pool: &KernelPool,
    rt: &mut Runtime,
    tokens: &[u32],
    speaker: Option<&str>,
    language: Option<&str>,
    options: &GenerateOptions,
    mut progress: Option<ProgressFn<'_>>,
    mut on_frame: impl FnMut(&CodeFrames) -> ControlFlow<()>,
) -> Result<FrameRun, GenerateError> {
    let Weights {
        store,
        talker,
        code_predictor,
    } = weights;
    let t = &config.talker_config;
    prompt::validate_tokens(tokens, talker.text_vocab_size())?;
    let speaker = resolve_name(&t.spk_id, speaker, "speaker");
    let language = resolve_name(&t.codec_language_id, language, "language");

    rt.rng.reseed(options.seed);
    let mut clock = Stopwatch::start();
    let mut prefill_ms = 0.0;
    let mut talker_ms = 0.0;
    let mut subtalker_ms = 0.0;

    let mut prompt = prompt::build(
        talker,
        store,
        pool,
        config,
        tokens,
        speaker,
        language,
        &mut rt.talker_scratch,
    )?;
    let h = talker.hidden_size();
    let prefill_len = prompt.prefill_len();
    let state = talker_state(&mut rt.talker_state, talker, config, prefill_len);
    let mut prefill = std::mem::take(&mut prompt.prefill);
    talker.prefill(pool, state, &mut prefill);
    let mut hidden = prefill[(prefill_len - 1) * h..].to_vec();
    clock.lap_into(&mut prefill_ms);

    let vocab = talker.vocab_size();
    let eos = t.codec_eos_token_id as usize;
    let groups = code_predictor.num_groups();
    let budget = options.token_budget();
    let fixed = options.fixed_codec_tokens > 0;
    let talker_params = options.talker_sampling();
    let sub_params = options.subtalker_sampling();

    let mut frames = CodeFrames::new(groups);
    let mut history: Vec<u32> = Vec::with_capacity(budget.min(TALKER_KV_HEADROOM));
    let mut codes = vec![0u32; groups];
    let mut stop = StopReason::MaxTokens;
    rt.logits.resize(vocab, 0.0);

    for step in 0..budget {
        if step > 0 {
            talker.step(pool, state, &mut hidden);
        }
        let logits = &mut rt.logits;
        talker.logits(pool, &hidden, logits);
        suppress_range(logits, vocab - RESERVED_CODES, vocab, Some(eos));
        apply_repetition_penalty(logits, &history, options.repetition_penalty);
        let mut token = rt.sampler.sample(logits, &talker_params, &mut rt.rng);
        if token == eos {
            if !fixed {
                stop = StopReason::Eos;
                clock.lap_into(&mut talker_ms);
                break;
            }
            let saved = logits[eos];
            logits[eos] = MASKED_LOGIT;
            token = rt.sampler.sample(logits, &talker_params, &mut rt.rng);
            logits[eos] = saved;
        }
        clock.lap_into(&mut talker_ms);

        codes[0] = token as u32;
        code_predictor.predict(
            store,
            pool,
            &mut rt.predictor_state,
            &talker.codec_embedding,
            &hidden,
            &sub_params,
            &mut rt.sampler,
            &mut rt.rng,
            &mut codes,
            &mut rt.predictor_scratch,
        )?;
        clock.lap_into(&mut subtalker_ms);

        frames.push(&codes);
        history.push(codes[0]);
        if let Some(report) = progress.as_deref_mut() {
            report(step + 1, budget);
        }
        if on_frame(&frames).is_break() {
            stop = StopReason::Aborted;
            break;
        }

        talker.codec_embedding.lookup(store, codes[0] as usize, &mut hidden)?;
        code_predictor.add_group_embeddings(store, &codes, &mut hidden, &mut rt.row)?;
        for (x, e) in hidden.iter_mut().zip(prompt.text_for_step(step)) {
            *x += e;
        }
        clock.lap_into(&mut talker_ms);
    }

    tracing::debug!(
        frames = frames.len(),
        stop = %stop,
        prefill_len,
        kv_len = state.seq_len(),
        "frame loop finished"
    );
    Ok(FrameRun {
        frames,
        stop,
        prefill_ms,
        talker_ms,
        subtalker_ms,
    })
}

/// Turns frames into audio chunks for a streaming callback.
///
/// In [`StreamDecode::Overlap`] mode each chunk is re-decoded together with
/// up to `context` already emitted frames of left context, and only the
/// samples of the new frames are passed on. In [`StreamDecode::Incremental`] mode one
/// codec stream state is carried through every frame.
pub(crate) struct ChunkEmitter<'a, F> {
    codec: &'a CodecDecoder,
    pool: &'a KernelPool,
    chunk: usize,
    context: usize,
    mode: StreamDecode,
    stream: Option<CodecStreamState>,
    pending: Vec<f32>,
    emitted_frames: usize,
    decoded_frames: usize,
    callback: F,
    pub codec_ms: f64,
    pub samples: usize,
    pub chunks: usize,
}

impl<'a, F> ChunkEmitter<'a, F>
where
    F: FnMut(&[f32]) -> ControlFlow<()>,
{
    pub fn new(
        codec: &'a CodecDecoder,
        pool: &'a KernelPool,
        chunk: usize,
        context: usize,
        mode: StreamDecode,
        callback: F,
    ) -> Self {
        Self {
            codec,
            pool,
            chunk,
            context,
            mode,
            stream: (mode == StreamDecode::Incremental).then(|| codec.new_stream()),
            pending: Vec::new(),
            emitted_frames: 0,
            decoded_frames: 0,
            callback,
            codec_ms: 0.0,
            samples: 0,
            chunks: 0,
        }
    }

    /// Called after every accepted frame.
    pub fn on_frame(&mut self, frames: &CodeFrames) -> ControlFlow<()> {
        if self.mode == StreamDecode::Incremental {
            self.decode_pending(frames);
        }
        if self.chunk > 0 && frames.len() % self.chunk == 0 {
            return self.emit(frames);
        }
        ControlFlow::Continue(())
    }

    /// Emit whatever has not been emitted yet.
    pub fn finish(&mut self, frames: &CodeFrames) -> ControlFlow<()> {
        if self.mode == StreamDecode::Incremental {
            self.decode_pending(frames);
        }
        if frames.len() > self.emitted_frames {
            return self.emit(frames);
        }
        ControlFlow::Continue(())
    }

    fn decode_pending(&mut self, frames: &CodeFrames) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let clock = Stopwatch::start();
        for i in self.decoded_frames..frames.len() {
            let wav = self.codec.decode_step(self.pool, stream, frames.frame(i));
            self.pending.extend_from_slice(&wav);
        }
        self.decoded_frames = frames.len();
        self.codec_ms += clock.elapsed_ms();
    }

    fn emit(&mut self, frames: &CodeFrames) -> ControlFlow<()> {
        let end = frames.len();
        let start = self.emitted_frames;
        let wav = match self.mode {
            StreamDecode::Incremental => std::mem::take(&mut self.pending),
            StreamDecode::Overlap => {
                let clock = Stopwatch::start();
                let context_start = start.saturating_sub(self.context);
                let wav = self.codec.decode_with_context(
                    self.pool,
                    frames.range(context_start, end),
                    frames.groups,
                    start - context_start,
                );
                self.codec_ms += clock.elapsed_ms();
                wav
            }
        };
        self.emitted_frames = end;
        if wav.is_empty() {
            return ControlFlow::Continue(());
        }
        tracing::debug!(chunk = self.chunks, frames = end - start, samples = wav.len(), "emitting audio chunk");
        self.chunks += 1;
        self.samples += wav.len();
        (self.callback)(&wav)
    }
}
