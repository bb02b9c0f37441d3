//! The offline sample-renderer engine: spectral analysis, MIDI scheduling,
//! resampling, cutoff search, caching, and WAV output.
//!
//! This crate carries no CLI surface of its own (see `swood-cli`) and
//! does not decode non-WAV audio; it consumes already-decoded PCM.

pub mod error;
pub mod gm;
pub mod midi;
pub mod primitives;
pub mod render;
pub mod resample;
pub mod sample;
pub mod sink;
pub mod soundfont;

pub use error::{Result, SwoodError};
