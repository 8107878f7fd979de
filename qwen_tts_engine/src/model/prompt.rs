//! Chat-template prompt → talker input embeddings.
//!
//! The caller passes pre-tokenized text laid out as
//! `[im_start, assistant, \n, CONTENT..., im_end, \n, im_start, assistant, \n]`.
//! The prefill sequence is:
//!
//! ```text
//! role[0..3]                              text only
//! tts_pad + codec(prefix[i])              for all but the last two prefix codes
//! tts_bos + codec(prefix[n - 2])
//! text(content[0]) + codec(codec_bos)
//! ```
//!
//! The remaining content tokens plus `tts_eos` form the trailing text that is
//! added to the talker input one row per generated frame.

use crate::config::{Config, NameTable, TalkerConfig};
use crate::error::GenerateError;
use crate::io::WeightStore;
use crate::nn::talker::{Talker, TalkerScratch};
use crate::quant::KernelPool;

/// Shortest accepted token sequence.
pub const MIN_PROMPT_TOKENS: usize = 8;

const ROLE_TOKENS: usize = 3;
const TEMPLATE_TAIL: usize = 5;

/// Embedded prompt ready for prefill.
#[derive(Debug, Clone)]
pub struct Prompt {
    /// `[prefill_len, hidden]`
    pub prefill: Vec<f32>,
    /// `[n_trailing, hidden]`; the last row is `tts_eos`
    pub trailing: Vec<f32>,
    /// Projected `tts_pad`, added once the trailing rows run out
    pub tts_pad: Vec<f32>,
    hidden: usize,
}

impl Prompt {
    pub fn prefill_len(&self) -> usize {
        self.prefill.len() / self.hidden
    }

    pub fn trailing_len(&self) -> usize {
        self.trailing.len() / self.hidden
    }

    /// Text embedding added to the talker input after frame `step`.
    pub fn text_for_step(&self, step: usize) -> &[f32] {
        if step < self.trailing_len() {
            &self.trailing[step * self.hidden..(step + 1) * self.hidden]
        } else {
            &self.tts_pad
        }
    }
}

/// Look `name` up in `table`. `None`, empty and `"auto"` mean no entry;
/// an unknown name is logged and ignored.
pub fn resolve_name(table: &NameTable, name: Option<&str>, kind: &str) -> Option<u32> {
    let name = name.map(str::trim).filter(|n| !n.is_empty() && !n.eq_ignore_ascii_case("auto"))?;
    let id = table.get(name);
    if id.is_none() {
        tracing::warn!(kind, name, "unknown name, continuing without its embedding");
    }
    id
}

/// Codec control tokens placed under the prompt's pad/bos section.
pub fn codec_prefix(config: &TalkerConfig, speaker: Option<u32>, language: Option<u32>) -> Vec<u32> {
    let mut prefix = match language {
        Some(lang) => vec![
            config.codec_think_id,
            config.codec_think_bos_id,
            lang,
            config.codec_think_eos_id,
        ],
        None => vec![
            config.codec_nothink_id,
            config.codec_think_bos_id,
            config.codec_think_eos_id,
        ],
    };
    prefix.extend(speaker);
    prefix.push(config.codec_pad_id);
    prefix.push(config.codec_bos_id);
    prefix
}

/// Content tokens after the first plus the closing `tts_eos` row.
pub fn trailing_len(n_tokens: usize) -> usize {
    n_tokens.saturating_sub(ROLE_TOKENS + 1 + TEMPLATE_TAIL) + 1
}

/// Check the token sequence before anything is allocated.
pub fn validate_tokens(tokens: &[u32], text_vocab: usize) -> Result<(), GenerateError> {
    if tokens.len() < MIN_PROMPT_TOKENS {
        return Err(GenerateError::TooFewTokens {
            got: tokens.len(),
            min: MIN_PROMPT_TOKENS,
        });
    }
    if let Some(&token) = tokens.iter().find(|&&t| t as usize >= text_vocab) {
        return Err(GenerateError::TokenOutOfRange {
            token,
            vocab: text_vocab,
        });
    }
    Ok(())
}

/// Embed `tokens` into a [`Prompt`].
#[allow(clippy::too_many_arguments)]
pub fn build(
    talker: &Talker,
    store: &WeightStore,
    pool: &KernelPool,
    config: &Config,
    tokens: &[u32],
    speaker: Option<u32>,
    language: Option<u32>,
    scratch: &mut TalkerScratch,
) -> Result<Prompt, GenerateError> {
    validate_tokens(tokens, talker.text_vocab_size())?;
    let h = talker.hidden_size();
    let prefix = codec_prefix(&config.talker_config, speaker, language);
    let prefill_len = ROLE_TOKENS + prefix.len();

    let embed = |token: u32, scratch: &mut TalkerScratch| -> Result<Vec<f32>, GenerateError> {
        let mut row = vec![0.0f32; h];
        talker.embed_text(store, pool, token, &mut row, scratch)?;
        Ok(row)
    };
    let tts_pad = embed(config.tts_pad_token_id, scratch)?;
    let tts_bos = embed(config.tts_bos_token_id, scratch)?;
    let tts_eos = embed(config.tts_eos_token_id, scratch)?;

    let mut prefill = vec![0.0f32; prefill_len * h];
    let mut rows = prefill.chunks_mut(h);
    for (&token, row) in tokens[..ROLE_TOKENS].iter().zip(rows.by_ref()) {
        talker.embed_text(store, pool, token, row, scratch)?;
    }
    let last_codec = prefix.len() - 1;
    for (i, (&code, row)) in prefix[..last_codec].iter().zip(rows.by_ref()).enumerate() {
        let text = if i + 1 < last_codec { &tts_pad } else { &tts_bos };
        row.copy_from_slice(text);
        talker.add_codec(store, code, row, scratch)?;
    }
    if let Some(row) = rows.next() {
        talker.embed_text(store, pool, tokens[ROLE_TOKENS], row, scratch)?;
        talker.add_codec(store, config.talker_config.codec_bos_id, row, scratch)?;
    }

    let n_trailing = trailing_len(tokens.len());
    let mut trailing = vec![0.0f32; n_trailing * h];
    for (i, row) in trailing.chunks_mut(h).enumerate() {
        if i + 1 < n_trailing {
            talker.embed_text(store, pool, tokens[ROLE_TOKENS + 1 + i], row, scratch)?;
        } else {
            row.copy_from_slice(&tts_eos);
        }
    }

    tracing::debug!(
        tokens = tokens.len(),
        prefill_len,
        trailing = n_trailing,
        speaker = ?speaker,
        language = ?language,
        "prompt embedded"
    );
    Ok(Prompt {
        prefill,
        trailing,
        tts_pad,
        hidden: h,
    })
}
