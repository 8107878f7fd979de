//! Serde views of the JSON files shipped with a model directory.

pub mod code_predictor_config;
pub mod generation_config;
pub mod rope_config;
pub mod talker_config;
pub mod tts_config;

pub use code_predictor_config::CodePredictorConfig;
pub use generation_config::GenerationConfig;
pub use rope_config::RopeScaling;
pub use talker_config::{NameTable, TalkerConfig};
pub use tts_config::Config;

/// Largest head dimension the attention scratch layout accepts.
pub const MAX_HEAD_DIM: usize = 512;
