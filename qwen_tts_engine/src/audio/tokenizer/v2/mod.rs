//! Building blocks of the 12Hz codec decoder.
//!
//! All convolutional layers work on channel-major buffers and carry an
//! incremental form for streaming decode.

pub mod causal_conv;
pub mod convnext;
pub mod snake_beta;
pub mod transformer;
