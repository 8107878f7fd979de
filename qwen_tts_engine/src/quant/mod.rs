//! Weight quantization formats and the fused kernels that consume them.
//!
//! Three encodings are supported:
//! - [`q8_0`]: 32-wide blocks with a symmetric f32 scale (codec transformer)
//! - [`int8`]: one symmetric scale per row (precision-sensitive projections)
//! - [`q4_k`]: 256-wide super-blocks with 6-bit sub-scales and mins (talker bulk)
//!
//! [`QuantMatrix`] wraps them behind a single matvec dispatch point. Kernels
//! never materialize a dequantized matrix: the activation is quantized once per
//! call and every row is reduced directly against the packed representation.

pub mod dot;
pub mod int8;
pub mod matrix;
pub mod pool;
pub mod q4_k;
pub mod q8_0;

pub use matrix::{Encoding, QuantMatrix};
pub use pool::KernelPool;
