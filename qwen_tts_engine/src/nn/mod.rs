//! Transformer engine shared by the talker, the code predictor and the codec.

pub mod attention;
pub mod code_predictor;
pub mod decoder_layer;
pub mod kv_cache;
pub mod mlp;
pub mod mt_rng;
pub mod norm;
pub mod rope;
pub mod sampling;
pub mod talker;
pub mod timing;
pub mod transformer;

pub use code_predictor::CodePredictor;
pub use kv_cache::KVCache;
pub use talker::Talker;
pub use transformer::{Transformer, TransformerState};
