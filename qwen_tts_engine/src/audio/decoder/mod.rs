//! Codec decoder: configuration, vocoder blocks, stream state and the full pipeline.

pub mod config;
pub mod residual_unit;
pub mod stream;
pub mod v2;

pub use config::CodecConfig;
pub use stream::CodecStreamState;
pub use v2::{CodecDecoder, IncrementalCheck};
