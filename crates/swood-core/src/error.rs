//! The error taxonomy every fallible operation in this crate returns.

use thiserror::Error;

/// Errors surfaced by the spectral analyzer, MIDI parser, renderer,
/// sink, and soundfont adapter.
///
/// Warnings (note-off without note-on, MIDI ending with open notes,
/// volume>95, binsize auto-halved) are never represented here — they are
/// emitted via `tracing::warn!` and never abort a render.
#[derive(Debug, Error)]
pub enum SwoodError {
    /// Negative threshold, non-positive speed, binsize<2, pan out of
    /// range, non-positive volume.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unreadable WAV, unsupported bit depth, empty buffer, or an
    /// all-zero spectrum that persists after repeated binsize halving.
    #[error("invalid sample: {0}")]
    InvalidSample(String),

    /// Type-2 MIDI, or a file `midly` cannot parse.
    #[error("unsupported MIDI: {0}")]
    UnsupportedMidi(String),

    /// A soundfont config line failed to parse. Carries the 1-based
    /// line number, the raw (comment-stripped) line text, and a
    /// human-readable description, mirroring `abc::Feedback`'s shape.
    #[error("config syntax error at line {line}: {message} ({raw_line:?})")]
    ConfigSyntax {
        line: usize,
        raw_line: String,
        message: String,
    },

    /// Any I/O failure on the output sink (file creation, write, mmap).
    #[error("output I/O error: {0}")]
    OutputIoError(#[from] std::io::Error),

    /// An invariant was violated (e.g. a negative cutoff). This should
    /// be unreachable; if it fires it is a bug, not user error.
    #[error("internal inconsistency: {0}")]
    InternalInconsistency(String),
}

pub type Result<T> = std::result::Result<T, SwoodError>;
