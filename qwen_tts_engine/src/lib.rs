//! # Qwen3-TTS inference engine
//!
//! A self-contained CPU runtime for Qwen3-TTS CustomVoice checkpoints that
//! needs no tensor framework at inference time.
//!
//! This crate provides:
//! - Quantized weight formats and fused matvec kernels (`quant`)
//! - A weight store over memory-mapped safetensors plus a quantized-weight cache (`io`)
//! - The talker / code-predictor transformers and their KV caches (`nn`)
//! - The 12Hz codec decoder in batch and incremental form (`audio`)
//! - The engine context and generation loop (`model::Model`)
//!
//! ## Architecture Overview
//!
//! 1. A pre-tokenized chat template is turned into an embedding sequence
//! 2. The talker predicts the first codebook of each audio frame
//! 3. The code predictor fills in the remaining codebooks of that frame
//! 4. The codec decoder renders all frames to 24kHz PCM, at once or chunk by chunk
//!
//! ## Example
//!
//! ```no_run
//! use qwen_tts_engine::model::{LoadOptions, Model};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut model = Model::load("/path/to/model", &LoadOptions::default())?;
//! let tokens = [151644, 77091, 198, 9707, 151645, 198, 151644, 77091, 198];
//! let samples = model.generate(&tokens, Some("vivian"), Some("english"))?;
//! println!("{} samples at {} Hz", samples.len(), model.sample_rate());
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod io;
pub mod model;
pub mod nn;
pub mod quant;

pub use error::{GenerateError, LoadError};
