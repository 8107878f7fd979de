//! A weight matrix in exactly one encoding, with one matvec dispatch point.

use std::io::Write;

use half::bf16;

use super::dot::dot_f32;
use super::pool::KernelPool;
use super::q4_k::{self, BlockQ4K};
use super::q8_0::{self, BlockQ8_0};
use super::int8;

/// Storage encoding of a [`QuantMatrix`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    F32,
    Bf16,
    Int8,
    Q8_0,
    Q4K,
}

impl Encoding {
    pub(crate) fn tag(self) -> u32 {
        match self {
            Encoding::F32 => 0,
            Encoding::Bf16 => 1,
            Encoding::Int8 => 2,
            Encoding::Q8_0 => 3,
            Encoding::Q4K => 4,
        }
    }

    pub(crate) fn from_tag(tag: u32) -> Option<Self> {
        Some(match tag {
            0 => Encoding::F32,
            1 => Encoding::Bf16,
            2 => Encoding::Int8,
            3 => Encoding::Q8_0,
            4 => Encoding::Q4K,
            _ => return None,
        })
    }

    /// Bytes needed to store a `[rows, cols]` matrix in this encoding.
    pub fn payload_len(self, rows: usize, cols: usize) -> usize {
        match self {
            Encoding::F32 => rows * cols * 4,
            Encoding::Bf16 => rows * cols * 2,
            Encoding::Int8 => rows * cols + rows * 4,
            Encoding::Q8_0 => rows * q8_0::blocks_for(cols) * std::mem::size_of::<BlockQ8_0>(),
            Encoding::Q4K => rows * q4_k::blocks_for(cols) * std::mem::size_of::<BlockQ4K>(),
        }
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Encoding::F32 => "f32",
            Encoding::Bf16 => "bf16",
            Encoding::Int8 => "int8-row",
            Encoding::Q8_0 => "q8_0",
            Encoding::Q4K => "q4_k",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatrixData {
    F32(Vec<f32>),
    Bf16(Vec<bf16>),
    Int8 { q: Vec<i8>, scales: Vec<f32> },
    Q8_0(Vec<BlockQ8_0>),
    Q4K(Vec<BlockQ4K>),
}

/// Row-major `[rows, cols]` weight matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantMatrix {
    rows: usize,
    cols: usize,
    data: MatrixData,
}

impl QuantMatrix {
    /// Encode f32 weights. `Bf16` rounds to nearest; the others quantize.
    pub fn from_f32(weights: Vec<f32>, rows: usize, cols: usize, encoding: Encoding) -> Self {
        assert_eq!(weights.len(), rows * cols, "weight buffer does not match [{rows}, {cols}]");
        let data = match encoding {
            Encoding::F32 => MatrixData::F32(weights),
            Encoding::Bf16 => MatrixData::Bf16(weights.iter().map(|&v| bf16::from_f32(v)).collect()),
            Encoding::Int8 => {
                let (q, scales) = int8::quantize_per_row_int8(&weights, rows, cols);
                MatrixData::Int8 { q, scales }
            }
            Encoding::Q8_0 => MatrixData::Q8_0(q8_0::quantize_matrix(&weights, rows, cols)),
            Encoding::Q4K => MatrixData::Q4K(q4_k::quantize_superblock_4bit(&weights, rows, cols)),
        };
        Self { rows, cols, data }
    }

    /// Keep raw bf16 weights without conversion.
    pub fn from_bf16(data: Vec<bf16>, rows: usize, cols: usize) -> Self {
        assert_eq!(data.len(), rows * cols);
        Self {
            rows,
            cols,
            data: MatrixData::Bf16(data),
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn data(&self) -> &MatrixData {
        &self.data
    }

    pub fn encoding(&self) -> Encoding {
        match self.data {
            MatrixData::F32(_) => Encoding::F32,
            MatrixData::Bf16(_) => Encoding::Bf16,
            MatrixData::Int8 { .. } => Encoding::Int8,
            MatrixData::Q8_0(_) => Encoding::Q8_0,
            MatrixData::Q4K(_) => Encoding::Q4K,
        }
    }

    /// `out = W · x`. The activation is quantized once and reused for every row.
    pub fn matvec(&self, pool: &KernelPool, x: &[f32], out: &mut [f32]) {
        assert_eq!(x.len(), self.cols, "matvec input width");
        assert_eq!(out.len(), self.rows, "matvec output height");
        let cols = self.cols;
        match &self.data {
            MatrixData::F32(w) => {
                pool.map_rows(out, |r| dot_f32(&w[r * cols..(r + 1) * cols], x));
            }
            MatrixData::Bf16(w) => pool.map_rows(out, |r| {
                w[r * cols..(r + 1) * cols]
                    .iter()
                    .zip(x)
                    .map(|(a, b)| a.to_f32() * b)
                    .sum()
            }),
            MatrixData::Int8 { q, scales } => {
                let (xq, xs) = int8::quantize_activation(x);
                int8::matvec(pool, out, q, scales, cols, &xq, xs);
            }
            MatrixData::Q8_0(blocks) => {
                let xq = q8_0::quantize(x);
                q8_0::matvec(pool, out, blocks, cols, &xq);
            }
            MatrixData::Q4K(blocks) => {
                let xq = q4_k::quantize_row_q8k(x);
                q4_k::matvec(pool, out, blocks, cols, &xq);
            }
        }
    }

    /// Token-by-token matvec over `xs = [n, cols]` into `out = [n, rows]`.
    pub fn matmul(&self, pool: &KernelPool, xs: &[f32], out: &mut [f32]) {
        let n = xs.len() / self.cols.max(1);
        assert_eq!(out.len(), n * self.rows);
        for (x, o) in xs.chunks(self.cols).zip(out.chunks_mut(self.rows)) {
            self.matvec(pool, x, o);
        }
    }

    /// Reconstruct one row as f32.
    pub fn dequantize_row(&self, r: usize, out: &mut [f32]) {
        assert!(r < self.rows);
        assert_eq!(out.len(), self.cols);
        let cols = self.cols;
        match &self.data {
            MatrixData::F32(w) => out.copy_from_slice(&w[r * cols..(r + 1) * cols]),
            MatrixData::Bf16(w) => {
                for (o, v) in out.iter_mut().zip(&w[r * cols..(r + 1) * cols]) {
                    *o = v.to_f32();
                }
            }
            MatrixData::Int8 { q, scales } => {
                int8::dequantize_row(&q[r * cols..(r + 1) * cols], scales[r], out)
            }
            MatrixData::Q8_0(blocks) => {
                let bpr = q8_0::blocks_for(cols);
                q8_0::dequantize_row(&blocks[r * bpr..(r + 1) * bpr], out);
            }
            MatrixData::Q4K(blocks) => {
                let bpr = q4_k::blocks_for(cols);
                q4_k::dequantize_row(&blocks[r * bpr..(r + 1) * bpr], out);
            }
        }
    }

    pub fn payload_len(&self) -> usize {
        self.encoding().payload_len(self.rows, self.cols)
    }

    /// Serialize the raw encoded bytes (little-endian, native block layout).
    pub(crate) fn write_payload<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        match &self.data {
            MatrixData::F32(v) => w.write_all(bytemuck::cast_slice(v)),
            MatrixData::Bf16(v) => w.write_all(bytemuck::cast_slice(v)),
            MatrixData::Int8 { q, scales } => {
                w.write_all(bytemuck::cast_slice(q))?;
                w.write_all(bytemuck::cast_slice(scales))
            }
            MatrixData::Q8_0(v) => w.write_all(bytemuck::cast_slice(v)),
            MatrixData::Q4K(v) => w.write_all(bytemuck::cast_slice(v)),
        }
    }

    /// Rebuild a matrix from bytes produced by [`Self::write_payload`].
    ///
    /// The bytes are copied, so the source buffer (typically a mapped cache
    /// file) may be dropped afterwards. Returns `None` on a length mismatch.
    pub(crate) fn from_payload(encoding: Encoding, rows: usize, cols: usize, bytes: &[u8]) -> Option<Self> {
        if bytes.len() != encoding.payload_len(rows, cols) {
            return None;
        }
        let data = match encoding {
            Encoding::F32 => MatrixData::F32(bytemuck::pod_collect_to_vec(bytes)),
            Encoding::Bf16 => MatrixData::Bf16(bytemuck::pod_collect_to_vec(bytes)),
            Encoding::Int8 => {
                let (q, s) = bytes.split_at(rows * cols);
                MatrixData::Int8 {
                    q: bytemuck::pod_collect_to_vec(q),
                    scales: bytemuck::pod_collect_to_vec(s),
                }
            }
            Encoding::Q8_0 => MatrixData::Q8_0(bytemuck::pod_collect_to_vec(bytes)),
            Encoding::Q4K => MatrixData::Q4K(bytemuck::pod_collect_to_vec(bytes)),
        };
        Some(Self { rows, cols, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights(rows: usize, cols: usize) -> Vec<f32> {
        (0..rows * cols)
            .map(|i| (((i * 2654435761usize) % 2001) as f32 / 1000.0) - 1.0)
            .collect()
    }

    #[test]
    fn test_every_encoding_tracks_dense_result() {
        let pool = KernelPool::inline();
        let (rows, cols) = (24, 512);
        let w = weights(rows, cols);
        let x: Vec<f32> = (0..cols).map(|i| ((i % 13) as f32 - 6.0) / 6.0).collect();
        let dense = QuantMatrix::from_f32(w.clone(), rows, cols, Encoding::F32);
        let mut expected = vec![0.0f32; rows];
        dense.matvec(&pool, &x, &mut expected);

        for (encoding, tol) in [
            (Encoding::Bf16, 0.05),
            (Encoding::Int8, 0.5),
            (Encoding::Q8_0, 0.5),
            (Encoding::Q4K, 4.0),
        ] {
            let m = QuantMatrix::from_f32(w.clone(), rows, cols, encoding);
            assert_eq!(m.encoding(), encoding);
            let mut out = vec![0.0f32; rows];
            m.matvec(&pool, &x, &mut out);
            for (a, b) in out.iter().zip(&expected) {
                assert!((a - b).abs() < tol, "{encoding}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn test_payload_restores_identical_matrix() {
        let w = weights(3, 300);
        for encoding in [Encoding::Int8, Encoding::Q8_0, Encoding::Q4K, Encoding::Bf16] {
            let m = QuantMatrix::from_f32(w.clone(), 3, 300, encoding);
            let mut bytes = Vec::new();
            m.write_payload(&mut bytes).unwrap();
            assert_eq!(bytes.len(), m.payload_len());
            let back = QuantMatrix::from_payload(encoding, 3, 300, &bytes).unwrap();
            assert_eq!(back, m);
            assert!(QuantMatrix::from_payload(encoding, 3, 301, &bytes).is_none());
        }
    }

    #[test]
    fn test_matmul_is_rowwise_matvec() {
        let pool = KernelPool::inline();
        let m = QuantMatrix::from_f32(weights(8, 64), 8, 64, Encoding::Q8_0);
        let xs: Vec<f32> = (0..3 * 64).map(|i| (i as f32 * 0.01).sin()).collect();
        let mut out = vec![0.0f32; 3 * 8];
        m.matmul(&pool, &xs, &mut out);
        let mut single = vec![0.0f32; 8];
        m.matvec(&pool, &xs[64..128], &mut single);
        assert_eq!(&out[8..16], single.as_slice());
    }
}
