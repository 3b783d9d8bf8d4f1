//! Crate root: public surface and ambient configuration
//!
//! This module is the single entry-point downstream users import from. It
//! re-exports the orchestrator (`Engine`) and its configuration, and centers
//! the crate's logging setup.
//!
//! ## Invariants
//!
//! - **Determinism.** Two `Engine::run` calls given the same buffer and the
//!   same predicate classify identically — `classify`/`classify_detailed`
//!   are pure functions of their arguments.
//! - **No process-wide shared state.** An `Engine` owns its RNG and its
//!   `Database` handle; nothing here is a global, so two engines can run
//!   concurrently in the same process against different test keys without
//!   synchronization.
//! - **A corrupt database entry degrades, never lies.** A `Database` I/O
//!   failure is logged and the run proceeds in-memory rather than being
//!   surfaced as a test failure.
//!
//! `#![forbid(unsafe_code)]` holds crate-wide; every module here is pure
//! safe Rust.

#![forbid(unsafe_code)]

/// The byte buffer, block bookkeeping, and the shortlex ordering.
pub mod buffer;
/// Directory-backed example store and the reproducible blob codec.
pub mod database;
/// Orchestration loop: generate, classify, shrink, persist.
pub mod engine;
/// Error taxonomy surfaced across the crate.
pub mod error;
/// Generator interface and the core combinator set.
pub mod generator;
/// Fixed pass pipeline driving a failing buffer to a local minimum.
pub mod shrinker;
/// TestCase (Data): the draw primitive and structural recording.
pub mod testcase;

pub use crate::engine::{Engine, EngineConfig, PassReport, Phase};
pub use crate::error::{DatabaseError, EngineError, ShrinkerError};
pub use crate::testcase::{Outcome, Tag, Terminated, TestCase, Verdict};

/// Map `HYPOTHESIS_VERBOSITY_LEVEL` to a `tracing-subscriber` `EnvFilter`
/// directive. Returns `None` when the variable is unset or unrecognized,
/// leaving the caller's existing filter (or `tracing`'s own default) alone.
///
/// This crate only emits events through `tracing`; it never installs a
/// subscriber itself, so a binary embedding it is free to wire this into
/// `tracing_subscriber::registry()` however it likes:
///
/// ```ignore
/// let filter = qa_core::verbosity_filter_directive().unwrap_or("warn");
/// tracing_subscriber::fmt().with_env_filter(filter).init();
/// ```
pub fn verbosity_filter_directive() -> Option<&'static str> {
    match std::env::var("HYPOTHESIS_VERBOSITY_LEVEL").ok()?.as_str() {
        "quiet" => Some("warn"),
        "normal" => Some("info"),
        "verbose" => Some("debug"),
        "debug" => Some("trace"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_directive_maps_known_levels() {
        std::env::set_var("HYPOTHESIS_VERBOSITY_LEVEL", "verbose");
        assert_eq!(verbosity_filter_directive(), Some("debug"));
        std::env::remove_var("HYPOTHESIS_VERBOSITY_LEVEL");
        assert_eq!(verbosity_filter_directive(), None);
    }
}
