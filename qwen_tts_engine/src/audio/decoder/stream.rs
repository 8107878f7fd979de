//! Carried state for frame-by-frame codec decoding.

use crate::nn::TransformerState;

/// State one vocoder block carries between frames.
#[derive(Debug, Clone)]
pub struct BlockStreamState {
    /// Transposed-conv overlap tail, `[out_dim, kernel - stride]`
    pub overlap: Vec<f32>,
    /// conv1 input tail of each residual unit
    pub units: Vec<Vec<f32>>,
}

/// Everything needed to continue decoding one audio stream.
///
/// Created by [`super::CodecDecoder::new_stream`]. Feeding frames one at a
/// time through [`super::CodecDecoder::decode_step`] reproduces the batch
/// decode of the same frames. Independent streams may share one decoder.
#[derive(Debug, Clone)]
pub struct CodecStreamState {
    pub(crate) pre_conv: Vec<f32>,
    pub(crate) transformer: TransformerState,
    pub(crate) upsample: Vec<Vec<f32>>,
    pub(crate) vocoder_pre_conv: Vec<f32>,
    pub(crate) blocks: Vec<BlockStreamState>,
    pub(crate) final_conv: Vec<f32>,
    pub(crate) frames: usize,
}

impl CodecStreamState {
    /// Frames decoded so far.
    pub fn frames(&self) -> usize {
        self.frames
    }
}
