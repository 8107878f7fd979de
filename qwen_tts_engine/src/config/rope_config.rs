//! RoPE scaling block of the talker configuration.

use serde::{Deserialize, Deserializer};

/// The subset of `rope_scaling` the engine reads.
///
/// HuggingFace configs carry either `"type"` or `"rope_type"` (sometimes both);
/// `rope_type` wins when both are present.
#[derive(Debug, Clone, PartialEq)]
pub struct RopeScaling {
    pub rope_type: Option<String>,

    /// Multimodal section sizes for temporal, height, width
    /// e.g. `[24, 20, 20]` splits a 128-wide head into 3 rotary streams
    pub mrope_section: Vec<usize>,

    /// Whether the three streams are interleaved across frequency slots
    pub interleaved: bool,
}

#[derive(Deserialize)]
struct RopeScalingHelper {
    #[serde(rename = "type")]
    type_field: Option<String>,
    rope_type: Option<String>,
    #[serde(default)]
    mrope_section: Vec<usize>,
    #[serde(default)]
    interleaved: bool,
}

impl<'de> Deserialize<'de> for RopeScaling {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let helper = RopeScalingHelper::deserialize(deserializer)?;
        Ok(RopeScaling {
            rope_type: helper.rope_type.or(helper.type_field),
            mrope_section: helper.mrope_section,
            interleaved: helper.interleaved,
        })
    }
}

impl RopeScaling {
    /// The three section sizes, when exactly three are configured.
    pub fn sections(&self) -> Option<[usize; 3]> {
        match self.mrope_section.as_slice() {
            &[t, h, w] => Some([t, h, w]),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rope_type_takes_precedence() {
        let json = r#"{"type": "old_value", "rope_type": "default", "mrope_section": [24, 20, 20]}"#;
        let config: RopeScaling = serde_json::from_str(json).unwrap();
        assert_eq!(config.rope_type.as_deref(), Some("default"));
        assert_eq!(config.sections(), Some([24, 20, 20]));
    }

    #[test]
    fn test_type_only() {
        let config: RopeScaling = serde_json::from_str(r#"{"type": "mrope"}"#).unwrap();
        assert_eq!(config.rope_type.as_deref(), Some("mrope"));
        assert_eq!(config.sections(), None);
        assert!(!config.interleaved);
    }

    #[test]
    fn test_wrong_section_count_is_not_three_stream() {
        let config: RopeScaling = serde_json::from_str(r#"{"mrope_section": [16, 16]}"#).unwrap();
        assert_eq!(config.sections(), None);
    }
}
