//! Error taxonomy
//!
//! Each component that can fail independently gets its own enum; `EngineError`
//! is the union a caller actually sees coming out of `Engine::run`. Conversion
//! is via `#[from]`, wrapping each source error without re-deriving its
//! variants.

use std::path::PathBuf;

use thiserror::Error;

use crate::buffer::BufferError;

/// Failures from the directory-backed example store.
///
/// These are never propagated as a test failure: the
/// engine logs them at `warn` and degrades to in-memory operation for that
/// run. The type exists so callers who talk to the database directly (e.g.
/// an inspection tool) get a typed error instead of `std::io::Error`.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("reproducible blob has version {found}, expected {expected}")]
    BlobVersionMismatch { expected: u8, found: u8 },
    #[error("reproducible blob is malformed: {0}")]
    BlobMalformed(String),
}

/// Failures internal to the shrinker.
#[derive(Debug, Error)]
pub enum ShrinkerError {
    #[error(
        "shrinker invariant violated: accepted move did not strictly decrease shortlex rank"
    )]
    NonDecreasingMove,
}

/// The outcome of one `Engine::run` invocation that isn't a clean pass.
///
/// `Unsatisfied`, `OverrunSaturated`, and `FailingInput` are ordinary,
/// recoverable-by-the-caller outcomes. `DeadlineExceeded` is reported as
/// a `FailingInput` with a dedicated tag by the time it reaches here (the
/// raw variant is kept for callers who want to distinguish it without string
/// matching the tag). `Internal` is fatal.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(
        "unable to find {valid_count} valid inputs in {iterations} iterations \
         ({invalid_count} invalid, {invalid_ratio:.1}% of iterations)"
    )]
    Unsatisfied {
        valid_count: usize,
        invalid_count: usize,
        iterations: usize,
        invalid_ratio: f64,
    },

    #[error(
        "every generation attempt overran the {buffer_size}-byte buffer; \
         the generator likely needs more room (raise buffer_size)"
    )]
    OverrunSaturated { buffer_size: usize, attempts: usize },

    #[error("falsified after {shrinks} shrink attempt(s), tag {tag:x}: {message}")]
    FailingInput {
        tag: u64,
        message: String,
        shrinks: usize,
        blob: String,
    },

    #[error("predicate exceeded its {deadline_ms}ms deadline")]
    DeadlineExceeded { deadline_ms: u64 },

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Shrinker(#[from] ShrinkerError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}
