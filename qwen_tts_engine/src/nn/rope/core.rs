//! Precomputed cos/sin tables and the rotate-half RoPE kernel.

use super::talker::MropeSections;

/// Inverse frequencies `1 / theta^(2i / head_dim)` for `i < head_dim / 2`.
pub fn inv_freq(head_dim: usize, theta: f64) -> Vec<f32> {
    (0..head_dim / 2)
        .map(|i| (1.0 / theta.powf(2.0 * i as f64 / head_dim as f64)) as f32)
        .collect()
}

/// Growable per-position cos/sin table of width `head_dim`.
///
/// Each row stores the half-width angles twice (`cos[i] == cos[i + half]`)
/// so the application kernel can index both halves directly.
#[derive(Debug, Clone)]
pub struct RopeTable {
    head_dim: usize,
    inv_freq: Vec<f32>,
    sections: Option<MropeSections>,
    cos: Vec<f32>,
    sin: Vec<f32>,
}

impl RopeTable {
    /// Single-stream table.
    pub fn new(head_dim: usize, theta: f64) -> Self {
        Self {
            head_dim,
            inv_freq: inv_freq(head_dim, theta),
            sections: None,
            cos: Vec::new(),
            sin: Vec::new(),
        }
    }

    /// Three-stream table whose rows merge per-section angles.
    pub fn multimodal(head_dim: usize, theta: f64, sections: MropeSections) -> Self {
        Self {
            sections: Some(sections),
            ..Self::new(head_dim, theta)
        }
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Number of positions currently tabulated.
    pub fn len(&self) -> usize {
        if self.head_dim == 0 {
            0
        } else {
            self.cos.len() / self.head_dim
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Extend the table so positions `[0, positions)` are available.
    pub fn ensure(&mut self, positions: usize) {
        let have = self.len();
        if positions <= have {
            return;
        }
        self.cos.resize(positions * self.head_dim, 0.0);
        self.sin.resize(positions * self.head_dim, 0.0);
        for pos in have..positions {
            let start = pos * self.head_dim;
            let end = start + self.head_dim;
            match &self.sections {
                Some(sections) => sections.fill_row(
                    [pos, pos, pos],
                    &self.inv_freq,
                    &mut self.cos[start..end],
                    &mut self.sin[start..end],
                ),
                None => fill_row(
                    pos,
                    &self.inv_freq,
                    &mut self.cos[start..end],
                    &mut self.sin[start..end],
                ),
            }
        }
    }

    /// `(cos, sin)` rows for a tabulated position.
    pub fn row(&self, pos: usize) -> (&[f32], &[f32]) {
        let start = pos * self.head_dim;
        let end = start + self.head_dim;
        (&self.cos[start..end], &self.sin[start..end])
    }
}

fn fill_row(pos: usize, inv_freq: &[f32], cos: &mut [f32], sin: &mut [f32]) {
    let half = inv_freq.len();
    for (i, &f) in inv_freq.iter().enumerate() {
        let angle = pos as f32 * f;
        let (s, c) = angle.sin_cos();
        cos[i] = c;
        cos[i + half] = c;
        sin[i] = s;
        sin[i + half] = s;
    }
}

/// Rotate every head of `x` (packed `[n_heads, head_dim]`) in place.
pub fn apply_rope(x: &mut [f32], head_dim: usize, cos: &[f32], sin: &[f32]) {
    let half = head_dim / 2;
    for head in x.chunks_mut(head_dim) {
        for i in 0..half {
            let x0 = head[i];
            let x1 = head[i + half];
            head[i] = x0 * cos[i] - x1 * sin[i];
            head[i + half] = x1 * cos[i + half] + x0 * sin[i + half];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_zero_is_identity() {
        let mut table = RopeTable::new(8, 10000.0);
        table.ensure(1);
        let (cos, sin) = table.row(0);
        let mut x: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let orig = x.clone();
        apply_rope(&mut x, 8, cos, sin);
        assert_eq!(x, orig);
    }

    #[test]
    fn test_rotation_preserves_norm() {
        let mut table = RopeTable::new(64, 1_000_000.0);
        table.ensure(50);
        let (cos, sin) = table.row(37);
        let mut x: Vec<f32> = (0..128).map(|i| (i as f32 * 0.37).sin()).collect();
        let before: f32 = x.iter().map(|v| v * v).sum();
        apply_rope(&mut x, 64, cos, sin);
        let after: f32 = x.iter().map(|v| v * v).sum();
        assert!((before - after).abs() < 1e-3);
    }

    #[test]
    fn test_growth_keeps_existing_rows() {
        let mut table = RopeTable::new(16, 10000.0);
        table.ensure(4);
        let row3: Vec<f32> = table.row(3).0.to_vec();
        table.ensure(100);
        assert_eq!(table.len(), 100);
        assert_eq!(table.row(3).0, row3.as_slice());
        let (cos, _) = table.row(99);
        assert!((cos[0] - (99.0f32).cos()).abs() < 1e-6);
    }
}
