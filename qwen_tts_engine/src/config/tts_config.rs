//! Top-level model configuration (`config.json`).

use serde::Deserialize;

use crate::audio::decoder::CodecConfig;
use crate::config::{MAX_HEAD_DIM, talker_config::TalkerConfig};
use crate::error::LoadError;
use crate::nn::rope::MropeSections;

/// Top-level configuration for a Qwen3-TTS checkpoint.
///
/// Holds the talker configuration (which nests the code predictor) and the
/// text-side special token ids used by the prompt template.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Talker model configuration
    #[serde(default)]
    pub talker_config: TalkerConfig,

    /// Model type identifier ("custom_voice", "base", ...)
    pub tts_model_type: Option<String>,

    /// Message start token ID (default: 151644)
    #[serde(default = "default_im_start_token_id")]
    pub im_start_token_id: u32,

    /// Message end token ID (default: 151645)
    #[serde(default = "default_im_end_token_id")]
    pub im_end_token_id: u32,

    /// TTS padding token ID (default: 151671)
    #[serde(default = "default_tts_pad_token_id")]
    pub tts_pad_token_id: u32,

    /// TTS BOS token ID (default: 151672)
    #[serde(default = "default_tts_bos_token_id")]
    pub tts_bos_token_id: u32,

    /// TTS EOS token ID (default: 151673)
    #[serde(default = "default_tts_eos_token_id")]
    pub tts_eos_token_id: u32,
}

fn default_im_start_token_id() -> u32 {
    151644
}
fn default_im_end_token_id() -> u32 {
    151645
}
fn default_tts_pad_token_id() -> u32 {
    151671
}
fn default_tts_bos_token_id() -> u32 {
    151672
}
fn default_tts_eos_token_id() -> u32 {
    151673
}

impl Default for Config {
    fn default() -> Self {
        Self {
            talker_config: TalkerConfig::default(),
            tts_model_type: None,
            im_start_token_id: default_im_start_token_id(),
            im_end_token_id: default_im_end_token_id(),
            tts_pad_token_id: default_tts_pad_token_id(),
            tts_bos_token_id: default_tts_bos_token_id(),
            tts_eos_token_id: default_tts_eos_token_id(),
        }
    }
}

fn inconsistent(msg: String) -> LoadError {
    LoadError::Config(msg)
}

fn check_heads(model: &str, heads: usize, kv_heads: usize, head_dim: usize) -> Result<(), LoadError> {
    if heads == 0 || kv_heads == 0 || head_dim == 0 {
        return Err(inconsistent(format!(
            "{model}: heads={heads} kv_heads={kv_heads} head_dim={head_dim} must all be positive"
        )));
    }
    if heads % kv_heads != 0 {
        return Err(inconsistent(format!(
            "{model}: {heads} attention heads not divisible by {kv_heads} key/value heads"
        )));
    }
    if head_dim > MAX_HEAD_DIM {
        return Err(inconsistent(format!(
            "{model}: head_dim {head_dim} exceeds the maximum of {MAX_HEAD_DIM}"
        )));
    }
    Ok(())
}

impl Config {
    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Reject hyperparameters the engine cannot run.
    pub fn validate(&self) -> Result<(), LoadError> {
        let t = &self.talker_config;
        let cp = &t.code_predictor_config;
        check_heads("talker", t.num_attention_heads, t.num_key_value_heads, t.head_dim())?;
        check_heads("code predictor", cp.num_attention_heads, cp.num_key_value_heads, cp.head_dim)?;

        if t.num_hidden_layers == 0 || cp.num_hidden_layers == 0 {
            return Err(inconsistent("layer counts must be positive".to_string()));
        }
        if t.num_code_groups < 2 {
            return Err(inconsistent(format!(
                "num_code_groups {} leaves nothing for the code predictor",
                t.num_code_groups
            )));
        }
        if t.vocab_size < 1024 {
            return Err(inconsistent(format!(
                "talker vocab_size {} is smaller than the reserved control range",
                t.vocab_size
            )));
        }
        for (name, id) in [
            ("codec_eos_token_id", t.codec_eos_token_id),
            ("codec_bos_id", t.codec_bos_id),
            ("codec_pad_id", t.codec_pad_id),
            ("codec_think_id", t.codec_think_id),
            ("codec_nothink_id", t.codec_nothink_id),
            ("codec_think_bos_id", t.codec_think_bos_id),
            ("codec_think_eos_id", t.codec_think_eos_id),
        ] {
            if id as usize >= t.vocab_size {
                return Err(inconsistent(format!(
                    "{name} {id} is outside the codec vocabulary of {}",
                    t.vocab_size
                )));
            }
        }
        for (table, entries) in [("spk_id", &t.spk_id), ("codec_language_id", &t.codec_language_id)] {
            for name in entries.names() {
                if entries.get(name).is_some_and(|id| id as usize >= t.vocab_size) {
                    return Err(inconsistent(format!("{table} entry `{name}` is outside the codec vocabulary")));
                }
            }
        }
        for (name, id) in [
            ("im_start_token_id", self.im_start_token_id),
            ("im_end_token_id", self.im_end_token_id),
            ("tts_pad_token_id", self.tts_pad_token_id),
            ("tts_bos_token_id", self.tts_bos_token_id),
            ("tts_eos_token_id", self.tts_eos_token_id),
        ] {
            if id as usize >= t.text_vocab_size {
                return Err(inconsistent(format!(
                    "{name} {id} is outside the text vocabulary of {}",
                    t.text_vocab_size
                )));
            }
        }
        Ok(())
    }

    /// Cross-check the codec configuration against the talker.
    pub fn validate_codec(&self, codec: &CodecConfig) -> Result<(), LoadError> {
        let t = &self.talker_config;
        if codec.num_quantizers == 0 || codec.num_quantizers > t.num_code_groups {
            return Err(inconsistent(format!(
                "codec has {} quantizers but frames carry {} code groups",
                codec.num_quantizers, t.num_code_groups
            )));
        }
        if codec.latent_dim / 2 != codec.codebook_dim || codec.codebook_dim % 2 != 0 {
            return Err(inconsistent(format!(
                "codec latent_dim {} and codebook_dim {} do not split into two quantizer halves",
                codec.latent_dim, codec.codebook_dim
            )));
        }
        if t.code_predictor_config.vocab_size > codec.codebook_size {
            return Err(inconsistent(format!(
                "code predictor vocab {} exceeds codec codebook size {}",
                t.code_predictor_config.vocab_size, codec.codebook_size
            )));
        }
        codec.validate()
    }

    /// Multimodal RoPE sections for the talker.
    ///
    /// Returns `None` (single-stream rotation) when no sections are configured
    /// or when they do not cover `head_dim / 2` frequency slots.
    pub fn talker_mrope(&self) -> Option<MropeSections> {
        let t = &self.talker_config;
        let sections = t.mrope_section()?;
        let mrope = MropeSections::new(sections, t.head_dim());
        if mrope.is_none() {
            tracing::warn!(
                ?sections,
                head_dim = t.head_dim(),
                "mrope_section does not cover head_dim / 2; using single-stream RoPE"
            );
        }
        mrope
    }
}
