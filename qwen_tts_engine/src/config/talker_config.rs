//! Talker model configuration.

use serde::{Deserialize, Deserializer};

use crate::config::{code_predictor_config::CodePredictorConfig, rope_config::RopeScaling};

/// A name → codec token table such as `spk_id` or `codec_language_id`.
///
/// Entries keep file order. A value may be a bare integer or an array, in
/// which case its first element is the id. Lookups ignore ASCII case.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NameTable(Vec<(String, u32)>);

impl NameTable {
    pub fn new(entries: Vec<(String, u32)>) -> Self {
        Self(entries)
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|&(_, id)| id)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// `5` or `[5, ...]`
struct TokenId(u32);

impl<'de> Deserialize<'de> for TokenId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::{self, SeqAccess, Visitor};

        struct TokenIdVisitor;

        impl<'de> Visitor<'de> for TokenIdVisitor {
            type Value = TokenId;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a token id or a non-empty array of token ids")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                u32::try_from(v)
                    .map(TokenId)
                    .map_err(|_| E::custom(format!("token id {v} out of range")))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                u32::try_from(v)
                    .map(TokenId)
                    .map_err(|_| E::custom(format!("token id {v} out of range")))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let first: u32 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                while seq.next_element::<serde::de::IgnoredAny>()?.is_some() {}
                Ok(TokenId(first))
            }
        }

        deserializer.deserialize_any(TokenIdVisitor)
    }
}

impl<'de> Deserialize<'de> for NameTable {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::{MapAccess, Visitor};

        struct NameTableVisitor;

        impl<'de> Visitor<'de> for NameTableVisitor {
            type Value = NameTable;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a map of names to token ids")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((name, TokenId(id))) = map.next_entry::<String, TokenId>()? {
                    entries.push((name, id));
                }
                Ok(NameTable(entries))
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(NameTable::default())
            }
        }

        deserializer.deserialize_any(NameTableVisitor)
    }
}

/// Configuration for the main talker model.
///
/// The talker predicts the first code group of every frame. It uses
/// multimodal RoPE, which for text and audio tokens collapses to one stream.
#[derive(Debug, Clone, Deserialize)]
pub struct TalkerConfig {
    /// Code predictor sub-model configuration
    #[serde(default)]
    pub code_predictor_config: CodePredictorConfig,

    /// Codec vocabulary size (default: 3072)
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,

    /// Hidden size of the transformer (default: 1024)
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,

    /// Intermediate (FFN) size (default: 2048)
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,

    /// Number of transformer layers (default: 20)
    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,

    /// Number of attention heads (default: 16)
    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,

    /// Number of key-value heads for GQA (default: 2)
    #[serde(default = "default_num_key_value_heads")]
    pub num_key_value_heads: usize,

    /// Dimension of each attention head. When absent, `hidden_size / num_attention_heads`.
    #[serde(default)]
    pub head_dim: Option<usize>,

    /// RMS norm epsilon (default: 1e-6)
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,

    /// RoPE theta base frequency (default: 10000.0)
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,

    /// RoPE scaling configuration (carries mrope_section)
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,

    /// Number of code groups per frame (default: 32)
    #[serde(default = "default_num_code_groups")]
    pub num_code_groups: usize,

    /// Text embedding width (default: 2048)
    #[serde(default = "default_text_hidden_size")]
    pub text_hidden_size: usize,

    /// Text vocabulary size (default: 151936)
    #[serde(default = "default_text_vocab_size")]
    pub text_vocab_size: usize,

    #[serde(default = "default_codec_eos_token_id")]
    pub codec_eos_token_id: u32,

    #[serde(default = "default_codec_bos_id")]
    pub codec_bos_id: u32,

    #[serde(default = "default_codec_pad_id")]
    pub codec_pad_id: u32,

    #[serde(default = "default_codec_think_id")]
    pub codec_think_id: u32,

    #[serde(default = "default_codec_nothink_id")]
    pub codec_nothink_id: u32,

    #[serde(default = "default_codec_think_bos_id")]
    pub codec_think_bos_id: u32,

    #[serde(default = "default_codec_think_eos_id")]
    pub codec_think_eos_id: u32,

    /// Speaker name → codec token
    #[serde(default)]
    pub spk_id: NameTable,

    /// Language name → codec token
    #[serde(default)]
    pub codec_language_id: NameTable,
}

fn default_vocab_size() -> usize {
    3072
}
fn default_hidden_size() -> usize {
    1024
}
fn default_intermediate_size() -> usize {
    2048
}
fn default_num_hidden_layers() -> usize {
    20
}
fn default_num_attention_heads() -> usize {
    16
}
fn default_num_key_value_heads() -> usize {
    2
}
fn default_rms_norm_eps() -> f64 {
    1e-6
}
fn default_rope_theta() -> f64 {
    10000.0
}
fn default_num_code_groups() -> usize {
    32
}
fn default_text_hidden_size() -> usize {
    2048
}
fn default_text_vocab_size() -> usize {
    151936
}
fn default_codec_eos_token_id() -> u32 {
    2150
}
fn default_codec_bos_id() -> u32 {
    2149
}
fn default_codec_pad_id() -> u32 {
    2148
}
fn default_codec_think_id() -> u32 {
    2154
}
fn default_codec_nothink_id() -> u32 {
    2155
}
fn default_codec_think_bos_id() -> u32 {
    2156
}
fn default_codec_think_eos_id() -> u32 {
    2157
}

impl Default for TalkerConfig {
    fn default() -> Self {
        Self {
            code_predictor_config: CodePredictorConfig::default(),
            vocab_size: default_vocab_size(),
            hidden_size: default_hidden_size(),
            intermediate_size: default_intermediate_size(),
            num_hidden_layers: default_num_hidden_layers(),
            num_attention_heads: default_num_attention_heads(),
            num_key_value_heads: default_num_key_value_heads(),
            head_dim: None,
            rms_norm_eps: default_rms_norm_eps(),
            rope_theta: default_rope_theta(),
            rope_scaling: None,
            num_code_groups: default_num_code_groups(),
            text_hidden_size: default_text_hidden_size(),
            text_vocab_size: default_text_vocab_size(),
            codec_eos_token_id: default_codec_eos_token_id(),
            codec_bos_id: default_codec_bos_id(),
            codec_pad_id: default_codec_pad_id(),
            codec_think_id: default_codec_think_id(),
            codec_nothink_id: default_codec_nothink_id(),
            codec_think_bos_id: default_codec_think_bos_id(),
            codec_think_eos_id: default_codec_think_eos_id(),
            spk_id: NameTable::default(),
            codec_language_id: NameTable::default(),
        }
    }
}

impl TalkerConfig {
    /// Get the head dimension.
    ///
    /// Qwen3-TTS configures it explicitly; older configs fall back to
    /// `hidden_size / num_attention_heads`.
    pub fn head_dim(&self) -> usize {
        match self.head_dim {
            Some(d) if d > 0 => d,
            _ => self.hidden_size / self.num_attention_heads.max(1),
        }
    }

    /// Configured multimodal sections, if any.
    pub fn mrope_section(&self) -> Option<[usize; 3]> {
        self.rope_scaling.as_ref().and_then(RopeScaling::sections)
    }
}
