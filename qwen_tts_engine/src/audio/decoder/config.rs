//! Codec decoder configuration (`speech_tokenizer/config.json`).

use serde::Deserialize;

use crate::config::MAX_HEAD_DIM;
use crate::error::LoadError;

/// Configuration for the 12Hz codec decoder.
///
/// The decoder converts code frames back to audio using:
/// - Split residual vector quantizer dequantization
/// - A sliding-window transformer
/// - ConvNeXt upsampling blocks
/// - A snake-activation vocoder
#[derive(Debug, Clone, Deserialize)]
pub struct CodecConfig {
    /// Entries per codebook (default: 2048)
    #[serde(default = "default_codebook_size")]
    pub codebook_size: usize,

    /// Hidden size for transformer (default: 1024)
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,

    /// Latent width around the transformer (default: 1024)
    #[serde(default = "default_latent_dim")]
    pub latent_dim: usize,

    /// Quantizer output width; each codebook vector is half of it (default: 512)
    #[serde(default = "default_codebook_dim")]
    pub codebook_dim: usize,

    /// RoPE theta base (default: 10000.0)
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,

    /// Number of attention heads (default: 16)
    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,

    /// Number of key-value heads (default: 16)
    #[serde(default = "default_num_key_value_heads")]
    pub num_key_value_heads: usize,

    /// Head dimension (defaults to hidden_size / num_attention_heads)
    #[serde(default)]
    pub head_dim: Option<usize>,

    /// Sliding window size for attention (default: 72)
    #[serde(default = "default_sliding_window")]
    pub sliding_window: usize,

    /// Intermediate (FFN) size (default: 3072)
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,

    /// RMS norm epsilon (default: 1e-5)
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,

    /// Number of transformer layers (default: 8)
    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,

    /// Number of residual quantizers (default: 16)
    #[serde(default = "default_num_quantizers")]
    pub num_quantizers: usize,

    /// Upsampling rates for vocoder blocks (default: [8, 5, 4, 3])
    #[serde(default = "default_upsample_rates")]
    pub upsample_rates: Vec<usize>,

    /// Upsampling ratios for the pre-vocoder stages (default: [2, 2])
    #[serde(default = "default_upsampling_ratios")]
    pub upsampling_ratios: Vec<usize>,

    /// Vocoder input width; halved by every vocoder block (default: 1536)
    #[serde(default = "default_decoder_dim")]
    pub decoder_dim: usize,

    /// Output sample rate in Hz (default: 24000)
    #[serde(default = "default_sample_rate", alias = "output_sample_rate")]
    pub sample_rate: u32,
}

fn default_codebook_size() -> usize {
    2048
}
fn default_hidden_size() -> usize {
    1024
}
fn default_latent_dim() -> usize {
    1024
}
fn default_codebook_dim() -> usize {
    512
}
fn default_rope_theta() -> f64 {
    10000.0
}
fn default_num_attention_heads() -> usize {
    16
}
fn default_num_key_value_heads() -> usize {
    16
}
fn default_sliding_window() -> usize {
    72
}
fn default_intermediate_size() -> usize {
    3072
}
fn default_rms_norm_eps() -> f64 {
    1e-5
}
fn default_num_hidden_layers() -> usize {
    8
}
fn default_num_quantizers() -> usize {
    16
}
fn default_upsample_rates() -> Vec<usize> {
    vec![8, 5, 4, 3]
}
fn default_upsampling_ratios() -> Vec<usize> {
    vec![2, 2]
}
fn default_decoder_dim() -> usize {
    1536
}
fn default_sample_rate() -> u32 {
    24000
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            codebook_size: default_codebook_size(),
            hidden_size: default_hidden_size(),
            latent_dim: default_latent_dim(),
            codebook_dim: default_codebook_dim(),
            rope_theta: default_rope_theta(),
            num_attention_heads: default_num_attention_heads(),
            num_key_value_heads: default_num_key_value_heads(),
            head_dim: None,
            sliding_window: default_sliding_window(),
            intermediate_size: default_intermediate_size(),
            rms_norm_eps: default_rms_norm_eps(),
            num_hidden_layers: default_num_hidden_layers(),
            num_quantizers: default_num_quantizers(),
            upsample_rates: default_upsample_rates(),
            upsampling_ratios: default_upsampling_ratios(),
            decoder_dim: default_decoder_dim(),
            sample_rate: default_sample_rate(),
        }
    }
}

impl CodecConfig {
    /// Parse a speech tokenizer config.
    ///
    /// The published file nests decoder hyperparameters under
    /// `decoder_config` and keeps `output_sample_rate` at the top level; a flat
    /// file is accepted too.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let mut root: serde_json::Value = serde_json::from_str(json)?;
        let rate = root.get("output_sample_rate").cloned();
        match root.get_mut("decoder_config").map(serde_json::Value::take) {
            Some(mut decoder) => {
                if let (Some(rate), Some(obj)) = (rate, decoder.as_object_mut()) {
                    obj.entry("sample_rate").or_insert(rate);
                }
                serde_json::from_value(decoder)
            }
            None => serde_json::from_value(root),
        }
    }

    pub fn head_dim(&self) -> usize {
        match self.head_dim {
            Some(d) if d > 0 => d,
            _ => self.hidden_size / self.num_attention_heads.max(1),
        }
    }

    /// Output samples per code frame.
    pub fn samples_per_frame(&self) -> usize {
        self.upsample_rates.iter().product::<usize>() * self.upsampling_ratios.iter().product::<usize>()
    }

    /// Channel width after vocoder block `b` (the input width of block 0 is `decoder_dim`).
    pub fn vocoder_channels(&self, block: usize) -> usize {
        self.decoder_dim >> (block + 1)
    }

    pub fn validate(&self) -> Result<(), LoadError> {
        let bad = |msg: String| Err(LoadError::Config(format!("codec: {msg}")));
        let (heads, kv) = (self.num_attention_heads, self.num_key_value_heads);
        if heads == 0 || kv == 0 || heads % kv != 0 {
            return bad(format!("{heads} attention heads not divisible by {kv} key/value heads"));
        }
        let hd = self.head_dim();
        if hd == 0 || hd > MAX_HEAD_DIM {
            return bad(format!("head_dim {hd} outside 1..={MAX_HEAD_DIM}"));
        }
        if self.sliding_window == 0 {
            return bad("sliding_window must be positive".to_string());
        }
        if self.upsample_rates.is_empty() || self.upsample_rates.contains(&0) || self.upsampling_ratios.contains(&0) {
            return bad(format!(
                "upsampling factors {:?} / {:?} must be positive",
                self.upsample_rates, self.upsampling_ratios
            ));
        }
        let blocks = self.upsample_rates.len();
        if blocks >= usize::BITS as usize || self.decoder_dim % (1 << blocks) != 0 {
            return bad(format!(
                "decoder_dim {} cannot be halved {blocks} times",
                self.decoder_dim
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_decoder_config() {
        let json = r#"{
            "output_sample_rate": 16000,
            "decoder_config": {"num_quantizers": 8, "upsample_rates": [4, 4], "upsampling_ratios": [2]}
        }"#;
        let config = CodecConfig::from_json(json).unwrap();
        assert_eq!(config.num_quantizers, 8);
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.samples_per_frame(), 32);
    }

    #[test]
    fn test_flat_config_and_defaults() {
        let config = CodecConfig::from_json(r#"{"hidden_size": 512}"#).unwrap();
        assert_eq!(config.hidden_size, 512);
        assert_eq!(config.samples_per_frame(), 1920);
        assert_eq!(config.sample_rate, 24000);
        assert_eq!(config.head_dim(), 32);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_vocoder_channels_halve() {
        let config = CodecConfig::default();
        assert_eq!(config.vocoder_channels(0), 768);
        assert_eq!(config.vocoder_channels(3), 96);
    }

    #[test]
    fn test_decoder_dim_must_halve() {
        let config = CodecConfig {
            decoder_dim: 100,
            ..CodecConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
