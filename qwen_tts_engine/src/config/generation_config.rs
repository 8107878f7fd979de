//! Sampling defaults shipped as `generation_config.json`.

use serde::Deserialize;

/// Decoding defaults published with a checkpoint.
///
/// Every field is optional in the file; missing ones take the engine's
/// built-in values.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_true")]
    pub do_sample: bool,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,

    /// The published files spell this `subtalker_dosample`.
    #[serde(default = "default_true", alias = "subtalker_dosample")]
    pub subtalker_do_sample: bool,

    #[serde(default = "default_temperature")]
    pub subtalker_temperature: f32,

    #[serde(default = "default_top_k")]
    pub subtalker_top_k: usize,

    #[serde(default = "default_top_p")]
    pub subtalker_top_p: f32,

    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
}

fn default_true() -> bool {
    true
}
fn default_temperature() -> f32 {
    0.9
}
fn default_top_k() -> usize {
    50
}
fn default_top_p() -> f32 {
    1.0
}
fn default_repetition_penalty() -> f32 {
    1.05
}
fn default_max_new_tokens() -> usize {
    4096
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            do_sample: true,
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            repetition_penalty: default_repetition_penalty(),
            subtalker_do_sample: true,
            subtalker_temperature: default_temperature(),
            subtalker_top_k: default_top_k(),
            subtalker_top_p: default_top_p(),
            max_new_tokens: default_max_new_tokens(),
        }
    }
}

impl GenerationConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_published_file_shape() {
        let json = r#"{
            "do_sample": true,
            "repetition_penalty": 1.05,
            "temperature": 0.9,
            "top_p": 1.0,
            "top_k": 50,
            "subtalker_dosample": true,
            "subtalker_temperature": 0.9,
            "subtalker_top_p": 1.0,
            "subtalker_top_k": 50,
            "max_new_tokens": 8192
        }"#;
        let config = GenerationConfig::from_json(json).unwrap();
        assert_eq!(config.max_new_tokens, 8192);
        assert!(config.subtalker_do_sample);
        assert_eq!(config.top_k, 50);
    }

    #[test]
    fn test_empty_uses_defaults() {
        assert_eq!(GenerationConfig::from_json("{}").unwrap(), GenerationConfig::default());
    }
}
