//! Audio components.
//!
//! This module contains:
//! - `quantizer`: split residual vector quantizer (codes → latent)
//! - `tokenizer`: convolution, activation and transformer layers of the codec
//! - `decoder`: the codec decoder in batch and incremental form

pub mod decoder;
pub mod quantizer;
pub mod tokenizer;

pub use decoder::{CodecConfig, CodecDecoder, CodecStreamState};
