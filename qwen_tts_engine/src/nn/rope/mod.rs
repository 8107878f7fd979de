//! Rotary position encoding.
//!
//! - [`core`]: single-stream tables and the rotate-half application
//! - [`talker`]: three-stream (temporal/height/width) section merge used by the talker

pub mod core;
pub mod talker;

pub use self::core::{RopeTable, apply_rope};
pub use self::talker::MropeSections;
