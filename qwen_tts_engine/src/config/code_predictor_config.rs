//! Code predictor (sub-talker) configuration.

use serde::Deserialize;

/// Configuration for the code predictor sub-model.
///
/// The code predictor fills code groups 1..N of every frame from the talker's
/// hidden state and first code. It uses plain single-stream RoPE.
#[derive(Debug, Clone, Deserialize)]
pub struct CodePredictorConfig {
    /// Entries in each per-group embedding table and output head (default: 2048)
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,

    /// Hidden size of the transformer (default: 1024)
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,

    /// Intermediate (FFN) size (default: 3072)
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,

    /// Number of transformer layers (default: 5)
    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,

    /// Number of attention heads (default: 16)
    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,

    /// Number of key-value heads for GQA (default: 8)
    #[serde(default = "default_num_key_value_heads")]
    pub num_key_value_heads: usize,

    /// Dimension of each attention head (default: 128)
    #[serde(default = "default_head_dim")]
    pub head_dim: usize,
}

fn default_vocab_size() -> usize {
    2048
}
fn default_hidden_size() -> usize {
    1024
}
fn default_intermediate_size() -> usize {
    3072
}
fn default_num_hidden_layers() -> usize {
    5
}
fn default_num_attention_heads() -> usize {
    16
}
fn default_num_key_value_heads() -> usize {
    8
}
fn default_head_dim() -> usize {
    128
}

impl Default for CodePredictorConfig {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            hidden_size: default_hidden_size(),
            intermediate_size: default_intermediate_size(),
            num_hidden_layers: default_num_hidden_layers(),
            num_attention_heads: default_num_attention_heads(),
            num_key_value_heads: default_num_key_value_heads(),
            head_dim: default_head_dim(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: CodePredictorConfig =
            serde_json::from_str(r#"{"hidden_size": 256, "num_hidden_layers": 1}"#).unwrap();
        assert_eq!(config.hidden_size, 256);
        assert_eq!(config.num_hidden_layers, 1);
        assert_eq!(config.vocab_size, 2048);
        assert_eq!(config.num_key_value_heads, 8);
    }
}
