//! Error types surfaced by loading and generation.

use std::path::PathBuf;

use thiserror::Error;

use crate::model::CodeFrames;

/// Failure while building an engine context.
///
/// Every variant aborts the load; no partially constructed context is returned.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("inconsistent configuration: {0}")]
    Config(String),

    #[error("no safetensors weights found in {0}")]
    NoWeights(PathBuf),

    #[error("required tensor `{0}` is missing")]
    MissingTensor(String),

    #[error("tensor `{name}` has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("row {row} is outside the {rows} rows of `{name}`")]
    RowOutOfRange { name: String, row: usize, rows: usize },

    #[error("tensor `{name}` has unsupported dtype {dtype}")]
    UnsupportedDtype { name: String, dtype: String },

    #[error("weight container error: {0}")]
    Container(#[from] candle_core::Error),

    #[error("failed to build kernel thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Failure during generation.
#[derive(Error, Debug)]
pub enum GenerateError {
    #[error("input has {got} tokens, the chat template needs at least {min}")]
    TooFewTokens { got: usize, min: usize },

    #[error("input token {token} is outside the text vocabulary of {vocab}")]
    TokenOutOfRange { token: u32, vocab: usize },

    #[error("generation produced no codec frames")]
    NoFrames,

    /// Codes were generated but could not be rendered. The frames are kept so
    /// the caller can retry with [`crate::model::Model::decode_codes`].
    #[error("codec decoder unavailable: {reason}")]
    CodecUnavailable { reason: String, frames: CodeFrames },

    #[error("failed to load the codec decoder: {0}")]
    CodecLoad(#[source] LoadError),

    #[error("code frame has {got} groups, expected {expected}")]
    FrameWidth { got: usize, expected: usize },

    #[error("failed to read model weights: {0}")]
    Weights(#[from] LoadError),
}

/// Reasons a quantized cache file is rejected. Never fatal.
#[derive(Error, Debug)]
pub(crate) enum CacheError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad magic {0:#010x}")]
    Magic(u32),

    #[error("unsupported version {0}")]
    Version(u32),

    #[error("source fingerprint {found:#x} does not match {expected:#x}")]
    Fingerprint { expected: u64, found: u64 },

    #[error("layer counts {found:?} do not match {expected:?}")]
    LayerCount {
        expected: (u32, u32, u32),
        found: (u32, u32, u32),
    },

    #[error("file is truncated at offset {0}")]
    Truncated(usize),

    #[error("matrix `{name}` does not match the expected layout")]
    Layout { name: String },

    #[error("{0} trailing bytes after the last record")]
    TrailingBytes(usize),
}
