//! Model directory access: weight shards, the weight store and the quantized cache.

pub mod model_path;
pub mod qcache;
pub mod safetensors;

pub use model_path::ModelPaths;
pub use qcache::MatrixSpec;
pub use safetensors::{EmbeddingTable, WeightStore, WeightView};
