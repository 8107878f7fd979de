//! Causal convolution layers.
//!
//! Activations are channel-major: a `[channels, length]` buffer holds one
//! contiguous run of samples per channel. Both layers have a batch form and
//! an incremental form whose carried state makes chunked calls reproduce the
//! batch output exactly.

use crate::error::LoadError;
use crate::io::WeightStore;
use crate::quant::KernelPool;

/// Causal 1D convolution.
///
/// Pads the input on the left by `(kernel_size - 1) * dilation` zeros so the
/// output at time t only depends on inputs at times <= t.
#[derive(Debug, Clone)]
pub struct CausalConv1d {
    /// `[out_channels, in_channels / groups, kernel_size]`
    weight: Vec<f32>,
    bias: Vec<f32>,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    dilation: usize,
    groups: usize,
}

impl CausalConv1d {
    pub fn new(
        weight: Vec<f32>,
        bias: Option<Vec<f32>>,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        dilation: usize,
        groups: usize,
    ) -> Self {
        assert!(groups > 0 && in_channels % groups == 0 && out_channels % groups == 0);
        assert_eq!(weight.len(), out_channels * (in_channels / groups) * kernel_size);
        let bias = bias.unwrap_or_else(|| vec![0.0; out_channels]);
        assert_eq!(bias.len(), out_channels);
        Self {
            weight,
            bias,
            in_channels,
            out_channels,
            kernel_size,
            dilation,
            groups,
        }
    }

    /// Load `{prefix}.weight` and the optional `{prefix}.bias`.
    pub fn load(
        store: &WeightStore,
        prefix: &str,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        dilation: usize,
        groups: usize,
    ) -> Result<Self, LoadError> {
        let weight = store.load_f32(
            &format!("{prefix}.weight"),
            &[out_channels, in_channels / groups, kernel_size],
        )?;
        let bias = store.load_f32_optional(&format!("{prefix}.bias"), &[out_channels])?;
        Ok(Self::new(weight, bias, in_channels, out_channels, kernel_size, dilation, groups))
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Input samples per channel that an incremental caller must carry.
    pub fn state_len(&self) -> usize {
        (self.kernel_size - 1) * self.dilation
    }

    /// Zeroed incremental state, `[in_channels, state_len]`.
    pub fn new_state(&self) -> Vec<f32> {
        vec![0.0; self.in_channels * self.state_len()]
    }

    /// `input = [in_channels, length]` → `[out_channels, length]`.
    pub fn forward(&self, pool: &KernelPool, input: &[f32], length: usize) -> Vec<f32> {
        let mut state = self.new_state();
        self.forward_incremental(pool, input, length, &mut state)
    }

    /// Convolve `n` new samples per channel, continuing from `state`.
    ///
    /// `state` holds the last `state_len` inputs of every channel from earlier
    /// calls (zeros at the start of a stream) and is updated in place.
    pub fn forward_incremental(&self, pool: &KernelPool, input: &[f32], n: usize, state: &mut [f32]) -> Vec<f32> {
        assert_eq!(input.len(), self.in_channels * n, "conv input shape");
        let pad = self.state_len();
        assert_eq!(state.len(), self.in_channels * pad, "conv state shape");

        let width = pad + n;
        let mut padded = vec![0.0f32; self.in_channels * width];
        for c in 0..self.in_channels {
            let row = &mut padded[c * width..(c + 1) * width];
            row[..pad].copy_from_slice(&state[c * pad..(c + 1) * pad]);
            row[pad..].copy_from_slice(&input[c * n..(c + 1) * n]);
        }

        let mut out = vec![0.0f32; self.out_channels * n];
        let in_per_group = self.in_channels / self.groups;
        let out_per_group = self.out_channels / self.groups;
        let k = self.kernel_size;
        pool.map_chunks(&mut out, n, |oc, row| {
            row.fill(self.bias[oc]);
            let first_in = (oc / out_per_group) * in_per_group;
            for ic in 0..in_per_group {
                let x = &padded[(first_in + ic) * width..(first_in + ic + 1) * width];
                let w = &self.weight[(oc * in_per_group + ic) * k..(oc * in_per_group + ic + 1) * k];
                for (tap, &wk) in w.iter().enumerate() {
                    let shifted = &x[tap * self.dilation..tap * self.dilation + n];
                    for (o, &v) in row.iter_mut().zip(shifted) {
                        *o += wk * v;
                    }
                }
            }
        });

        for c in 0..self.in_channels {
            let row = &padded[c * width..(c + 1) * width];
            state[c * pad..(c + 1) * pad].copy_from_slice(&row[n..]);
        }
        out
    }
}

/// Causal 1D transposed convolution (upsampling by `stride`).
///
/// The full output of length `(L - 1) * stride + K` is trimmed by `K - stride`
/// on the right, leaving exactly `L * stride` samples.
#[derive(Debug, Clone)]
pub struct CausalConvTranspose1d {
    /// `[in_channels, out_channels, kernel_size]`
    weight: Vec<f32>,
    bias: Vec<f32>,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
}

impl CausalConvTranspose1d {
    pub fn new(
        weight: Vec<f32>,
        bias: Option<Vec<f32>>,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
    ) -> Self {
        assert!(kernel_size >= stride && stride > 0);
        assert_eq!(weight.len(), in_channels * out_channels * kernel_size);
        let bias = bias.unwrap_or_else(|| vec![0.0; out_channels]);
        assert_eq!(bias.len(), out_channels);
        Self {
            weight,
            bias,
            in_channels,
            out_channels,
            kernel_size,
            stride,
        }
    }

    pub fn load(
        store: &WeightStore,
        prefix: &str,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
    ) -> Result<Self, LoadError> {
        let weight = store.load_f32(
            &format!("{prefix}.weight"),
            &[in_channels, out_channels, kernel_size],
        )?;
        let bias = store.load_f32_optional(&format!("{prefix}.bias"), &[out_channels])?;
        Ok(Self::new(weight, bias, in_channels, out_channels, kernel_size, stride))
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    /// Overlap samples per output channel carried between incremental calls.
    pub fn overlap_len(&self) -> usize {
        self.kernel_size - self.stride
    }

    pub fn new_state(&self) -> Vec<f32> {
        vec![0.0; self.out_channels * self.overlap_len()]
    }

    /// `input = [in_channels, length]` → `[out_channels, length * stride]`.
    pub fn forward(&self, pool: &KernelPool, input: &[f32], length: usize) -> Vec<f32> {
        let mut overlap = self.new_state();
        self.forward_incremental(pool, input, length, &mut overlap)
    }

    /// Upsample `n` new frames with overlap-add against the previous call.
    ///
    /// `overlap` holds the un-biased tail contributions that earlier frames
    /// made to samples not yet emitted.
    pub fn forward_incremental(&self, pool: &KernelPool, input: &[f32], n: usize, overlap: &mut [f32]) -> Vec<f32> {
        assert_eq!(input.len(), self.in_channels * n, "transposed conv input shape");
        let ov = self.overlap_len();
        assert_eq!(overlap.len(), self.out_channels * ov, "transposed conv state shape");
        let (k, s) = (self.kernel_size, self.stride);
        let emit = n * s;
        if n == 0 {
            return Vec::new();
        }
        let raw_len = emit + ov;

        let mut raw = vec![0.0f32; self.out_channels * raw_len];
        pool.map_chunks(&mut raw, raw_len, |oc, row| {
            for ic in 0..self.in_channels {
                let w = &self.weight[(ic * self.out_channels + oc) * k..(ic * self.out_channels + oc + 1) * k];
                let x = &input[ic * n..(ic + 1) * n];
                for (t, &v) in x.iter().enumerate() {
                    for (r, &wk) in row[t * s..t * s + k].iter_mut().zip(w) {
                        *r += v * wk;
                    }
                }
            }
        });

        let mut out = vec![0.0f32; self.out_channels * emit];
        for oc in 0..self.out_channels {
            let row = &mut raw[oc * raw_len..(oc + 1) * raw_len];
            let tail = &mut overlap[oc * ov..(oc + 1) * ov];
            for (r, &o) in row.iter_mut().zip(tail.iter()) {
                *r += o;
            }
            let b = self.bias[oc];
            for (o, &r) in out[oc * emit..(oc + 1) * emit].iter_mut().zip(&row[..emit]) {
                *o = r + b;
            }
            tail.copy_from_slice(&row[emit..]);
        }
        out
    }
}
