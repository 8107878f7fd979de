//! 12Hz audio tokenizer (V2), decoder side.
//!
//! The decoder turns code frames back into audio:
//! ```text
//! Codes → Split RVQ Decode → Conv → Transformer → Upsample → Vocoder → Audio (24kHz)
//! ```

pub mod v2;
