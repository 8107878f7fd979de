//! Multi-axis rotary encoding for the talker.
//!
//! The rotary dimensions are split into temporal / height / width sections.
//! Over the full `head_dim` the section pattern is `[t, h, w, t, h, w]`, and
//! every dimension takes its angle from the position of its own stream. With
//! text and audio tokens only, all three positions coincide and the result
//! equals plain single-stream RoPE.

/// Section sizes over the half-width rotary dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MropeSections(pub [usize; 3]);

impl MropeSections {
    /// Validate the sections against a head dimension.
    pub fn new(sections: [usize; 3], head_dim: usize) -> Option<Self> {
        (2 * sections.iter().sum::<usize>() == head_dim).then_some(Self(sections))
    }

    /// Stream (0 = temporal, 1 = height, 2 = width) owning dimension `d`.
    pub fn stream_of(&self, d: usize) -> usize {
        let mut boundary = 0;
        for chunk in 0..6 {
            boundary += self.0[chunk % 3];
            if d < boundary {
                return chunk % 3;
            }
        }
        0
    }

    /// Fill one `head_dim` row from three stream positions.
    pub fn fill_row(&self, positions: [usize; 3], inv_freq: &[f32], cos: &mut [f32], sin: &mut [f32]) {
        let half = inv_freq.len();
        for d in 0..2 * half {
            let pos = positions[self.stream_of(d)];
            let angle = pos as f32 * inv_freq[d % half];
            let (s, c) = angle.sin_cos();
            cos[d] = c;
            sin[d] = s;
        }
    }
}
