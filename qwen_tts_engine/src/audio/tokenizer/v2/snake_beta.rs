//! SnakeBeta activation function.
//!
//! A modified Snake activation with separate alpha and beta parameters:
//! x + (1/beta) * sin²(x * alpha)

use crate::error::LoadError;
use crate::io::WeightStore;

const BETA_EPS: f32 = 1e-9;

/// SnakeBeta with its log-space parameters resolved at load time.
#[derive(Debug, Clone)]
pub struct SnakeBeta {
    /// `exp(alpha)` per channel
    alpha: Vec<f32>,
    /// `1 / (exp(beta) + eps)` per channel
    inv_beta: Vec<f32>,
}

impl SnakeBeta {
    /// Build from the stored log-space parameters.
    pub fn new(log_alpha: &[f32], log_beta: &[f32]) -> Self {
        assert_eq!(log_alpha.len(), log_beta.len());
        Self {
            alpha: log_alpha.iter().map(|a| a.exp()).collect(),
            inv_beta: log_beta.iter().map(|b| 1.0 / (b.exp() + BETA_EPS)).collect(),
        }
    }

    /// Load `{prefix}.alpha` and `{prefix}.beta`, both `[channels]`.
    pub fn load(store: &WeightStore, prefix: &str, channels: usize) -> Result<Self, LoadError> {
        let alpha = store.load_f32(&format!("{prefix}.alpha"), &[channels])?;
        let beta = store.load_f32(&format!("{prefix}.beta"), &[channels])?;
        Ok(Self::new(&alpha, &beta))
    }

    pub fn channels(&self) -> usize {
        self.alpha.len()
    }

    /// Apply in place to a channel-major `[channels, length]` buffer.
    pub fn forward_inplace(&self, x: &mut [f32], length: usize) {
        assert_eq!(x.len(), self.channels() * length, "snake input shape");
        if length == 0 {
            return;
        }
        for ((row, &a), &inv_b) in x.chunks_mut(length).zip(&self.alpha).zip(&self.inv_beta) {
            for v in row {
                let s = (*v * a).sin();
                *v += inv_b * s * s;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_log_params_give_classic_snake() {
        // alpha = beta = 1: x + sin²(x)
        let snake = SnakeBeta::new(&[0.0], &[0.0]);
        let mut x = [0.0f32, 1.0, -2.0];
        snake.forward_inplace(&mut x, 3);
        assert_eq!(x[0], 0.0);
        assert!((x[1] - (1.0 + 1.0f32.sin().powi(2))).abs() < 1e-6);
        assert!((x[2] - (-2.0 + 2.0f32.sin().powi(2))).abs() < 1e-6);
    }

    #[test]
    fn test_parameters_are_per_channel() {
        let snake = SnakeBeta::new(&[0.0, 1.0], &[0.0, 2.0]);
        let mut x = [0.5f32, 0.5];
        snake.forward_inplace(&mut x, 1);
        let a1 = 1.0f32.exp();
        let b1 = 1.0 / 2.0f32.exp();
        assert!((x[1] - (0.5 + b1 * (0.5 * a1).sin().powi(2))).abs() < 1e-6);
        assert!(x[0] != x[1]);
    }
}
