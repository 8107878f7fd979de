//! Logit processing and token sampling.
//!
//! Order of operations for the talker: suppression mask, repetition penalty,
//! temperature, then top-k / top-p selection. When top-p is disabled and
//! `0 < top_k < vocab`, a top-k-only fast path avoids the full softmax.

use crate::nn::attention::softmax;
use crate::nn::mt_rng::MtRng;

/// Logit value used to mask a token out.
pub const MASKED_LOGIT: f32 = -1e9;

/// Sampling parameters for one model head.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    /// Temperature for scaling logits; values `<= 0` are clamped to 1e-5
    pub temperature: f32,
    /// Number of top tokens to consider (0 = disabled)
    pub top_k: usize,
    /// Cumulative probability threshold (>= 1.0 = disabled)
    pub top_p: f32,
    /// Whether to sample (true) or take the argmax (false)
    pub do_sample: bool,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.9,
            top_k: 50,
            top_p: 1.0,
            do_sample: true,
        }
    }
}

impl SamplingParams {
    pub fn greedy() -> Self {
        Self {
            do_sample: false,
            ..Self::default()
        }
    }
}

/// Mask every id in `[start, end)` except `keep`.
pub fn suppress_range(logits: &mut [f32], start: usize, end: usize, keep: Option<usize>) {
    let end = end.min(logits.len());
    for (i, l) in logits.iter_mut().enumerate().take(end).skip(start) {
        if Some(i) != keep {
            *l = MASKED_LOGIT;
        }
    }
}

/// Divide positive logits and multiply negative ones by `penalty` for every
/// previously emitted token. A token emitted twice is penalized twice.
pub fn apply_repetition_penalty(logits: &mut [f32], generated: &[u32], penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    for &t in generated {
        if let Some(l) = logits.get_mut(t as usize) {
            if *l > 0.0 {
                *l /= penalty;
            } else {
                *l *= penalty;
            }
        }
    }
}

pub fn argmax(logits: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in logits.iter().enumerate() {
        if v > logits[best] {
            best = i;
        }
    }
    best
}

/// Token sampler with reusable buffers.
#[derive(Debug, Clone, Default)]
pub struct Sampler {
    probs: Vec<f32>,
    top_vals: Vec<f32>,
    top_idx: Vec<usize>,
    order: Vec<usize>,
}

impl Sampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw one token id from `logits`.
    pub fn sample(&mut self, logits: &[f32], params: &SamplingParams, rng: &mut MtRng) -> usize {
        if !params.do_sample {
            return argmax(logits);
        }
        let temperature = if params.temperature <= 0.0 { 1e-5 } else { params.temperature };
        let vocab = logits.len();
        if params.top_p >= 1.0 && params.top_k > 0 && params.top_k < vocab {
            self.sample_top_k(logits, params.top_k, temperature, rng)
        } else {
            self.sample_full(logits, params.top_k, params.top_p, temperature, rng)
        }
    }

    /// Keep a descending top-k by insertion, then sample from its softmax.
    fn sample_top_k(&mut self, logits: &[f32], k: usize, temperature: f32, rng: &mut MtRng) -> usize {
        self.top_vals.clear();
        self.top_idx.clear();
        for (i, &l) in logits.iter().enumerate() {
            let v = l / temperature;
            if self.top_vals.len() == k && v <= self.top_vals[k - 1] {
                continue;
            }
            let at = self.top_vals.iter().position(|&t| v > t).unwrap_or(self.top_vals.len());
            if self.top_vals.len() == k {
                self.top_vals.pop();
                self.top_idx.pop();
            }
            self.top_vals.insert(at, v);
            self.top_idx.insert(at, i);
        }

        let max = self.top_vals[0];
        let mut sum = 0.0f32;
        for v in self.top_vals.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        let r = rng.uniform() * sum;
        let mut cum = 0.0f32;
        for (p, &idx) in self.top_vals.iter().zip(&self.top_idx) {
            cum += p;
            if cum >= r {
                return idx;
            }
        }
        self.top_idx[self.top_idx.len() - 1]
    }

    /// Full-softmax path with optional top-k threshold and nucleus cut.
    fn sample_full(&mut self, logits: &[f32], top_k: usize, top_p: f32, temperature: f32, rng: &mut MtRng) -> usize {
        let vocab = logits.len();
        self.probs.clear();
        self.probs.extend(logits.iter().map(|l| l / temperature));
        softmax(&mut self.probs);

        if top_k > 0 && top_k < vocab {
            self.top_vals.clear();
            self.top_vals.extend_from_slice(&self.probs);
            self.top_vals.sort_unstable_by(|a, b| b.total_cmp(a));
            let threshold = self.top_vals[top_k - 1];
            for p in self.probs.iter_mut() {
                if *p < threshold {
                    *p = 0.0;
                }
            }
        }

        if top_p < 1.0 {
            self.order.clear();
            self.order.extend(0..vocab);
            let probs = &self.probs;
            self.order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));
            let mut cum = 0.0f32;
            let mut cutoff = vocab;
            for (i, &idx) in self.order.iter().enumerate() {
                cum += self.probs[idx];
                if cum >= top_p {
                    cutoff = i + 1;
                    break;
                }
            }
            for &idx in &self.order[cutoff..] {
                self.probs[idx] = 0.0;
            }
        }

        let sum: f32 = self.probs.iter().sum();
        let r = rng.uniform() * sum;
        let mut cum = 0.0f32;
        let mut last_nonzero = 0;
        for (i, &p) in self.probs.iter().enumerate() {
            if p > 0.0 {
                last_nonzero = i;
            }
            cum += p;
            if p > 0.0 && cum >= r {
                return i;
            }
        }
        last_nonzero
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logits() -> Vec<f32> {
        (0..200).map(|i| ((i * 37) % 101) as f32 / 10.0).collect()
    }

    #[test]
    fn test_repetition_penalty_signs() {
        let mut l = vec![2.0f32, -2.0, 1.0];
        apply_repetition_penalty(&mut l, &[0, 1], 2.0);
        assert_eq!(l, vec![1.0, -4.0, 1.0]);
        apply_repetition_penalty(&mut l, &[2, 99], 1.0);
        assert_eq!(l[2], 1.0);
    }

    #[test]
    fn test_suppress_range_keeps_one() {
        let mut l = vec![0.0f32; 10];
        suppress_range(&mut l, 6, 10, Some(8));
        assert_eq!(&l[..6], &[0.0; 6]);
        assert_eq!(l[6], MASKED_LOGIT);
        assert_eq!(l[8], 0.0);
        assert_eq!(l[9], MASKED_LOGIT);
    }

    #[test]
    fn test_fixed_seed_reproduces_tokens() {
        let l = logits();
        for params in [
            SamplingParams { temperature: 0.9, top_k: 50, top_p: 1.0, do_sample: true },
            SamplingParams { temperature: 0.7, top_k: 0, top_p: 0.8, do_sample: true },
            SamplingParams { temperature: 1.2, top_k: 20, top_p: 0.9, do_sample: true },
        ] {
            let run = || {
                let mut rng = MtRng::new(1234);
                let mut sampler = Sampler::new();
                (0..20).map(|_| sampler.sample(&l, &params, &mut rng)).collect::<Vec<_>>()
            };
            assert_eq!(run(), run());
        }
    }

    #[test]
    fn test_top_k_only_returns_top_candidates() {
        let l = logits();
        let mut sorted: Vec<(f32, usize)> = l.iter().copied().zip(0..).collect();
        sorted.sort_by(|a, b| b.0.total_cmp(&a.0));
        let allowed: Vec<usize> = sorted[..3].iter().map(|p| p.1).collect();
        let params = SamplingParams { temperature: 5.0, top_k: 3, top_p: 1.0, do_sample: true };
        let mut rng = MtRng::new(9);
        let mut sampler = Sampler::new();
        for _ in 0..200 {
            assert!(allowed.contains(&sampler.sample(&l, &params, &mut rng)));
        }
    }

    #[test]
    fn test_tiny_top_p_is_argmax() {
        let l = logits();
        let params = SamplingParams { temperature: 1.0, top_k: 0, top_p: 1e-6, do_sample: true };
        let mut rng = MtRng::new(3);
        let mut sampler = Sampler::new();
        for _ in 0..20 {
            assert_eq!(sampler.sample(&l, &params, &mut rng), argmax(&l));
        }
    }

    #[test]
    fn test_masked_tokens_are_never_drawn() {
        let mut l = vec![0.0f32; 64];
        suppress_range(&mut l, 32, 64, Some(40));
        let params = SamplingParams { temperature: 1.0, top_k: 0, top_p: 1.0, do_sample: true };
        let mut rng = MtRng::new(5);
        let mut sampler = Sampler::new();
        for _ in 0..500 {
            let t = sampler.sample(&l, &params, &mut rng);
            assert!(t < 32 || t == 40);
        }
    }

    #[test]
    fn test_greedy_and_zero_temperature() {
        let l = logits();
        let mut rng = MtRng::new(0);
        let mut sampler = Sampler::new();
        assert_eq!(sampler.sample(&l, &SamplingParams::greedy(), &mut rng), argmax(&l));
        let cold = SamplingParams { temperature: 0.0, top_k: 10, top_p: 1.0, do_sample: true };
        assert_eq!(sampler.sample(&l, &cold, &mut rng), argmax(&l));
    }
}
