//! TestCase (Data): the draw primitive and structural recording
//!
//! `TestCase` is the single execution context a predicate runs against. It
//! owns the candidate bytes, a monotonically advancing read cursor, the flat
//! list of blocks a [`crate::buffer::Buffer`] needs, and the example-region
//! stack that lets a [`crate::shrinker`] pass reason about structure without
//! any semantic knowledge of what a block encodes.
//!
//! ## Control flow without exceptions
//!
//! Unwinding out of arbitrarily nested generator calls via a raised
//! exception and a single catch at the outer frame has no sound Rust
//! analogue: a process-wide panic hook would mean concurrently-running
//! engines share state that cannot be made per-engine. Instead, termination
//! is an explicit [`Terminated`] value threaded through `Result` and `?`,
//! the way fallible draws compose through blocked builders elsewhere in
//! this crate. A draw looks exactly like ordinary, non-unwinding Rust:
//!
//! ```ignore
//! let n = some_generator.generate(tc)?;
//! ```
//!
//! The one case that still resembles the source's "raise on failure" is the
//! predicate's own verdict: a predicate body returns `Outcome::Failed(msg)`
//! (or calls [`TestCase::mark_interesting`] directly) and [`classify`] — the
//! harness — is the thing that turns that into `INTERESTING(tag)` by hashing
//! the message.

#![forbid(unsafe_code)]

use crate::buffer::Buffer;

/// Classifier distinguishing different failure modes of one predicate.
pub type Tag = u64;

/// Outcome of classifying one buffer against one predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Invalid,
    Overrun,
    Interesting(Tag),
}

impl Verdict {
    pub fn is_interesting(&self) -> bool {
        matches!(self, Verdict::Interesting(_))
    }

    pub fn tag(&self) -> Option<Tag> {
        match self {
            Verdict::Interesting(t) => Some(*t),
            _ => None,
        }
    }
}

/// A draw-time control-flow escape. Propagated with `?` through generator
/// combinators; never inspected by combinator bodies, only by [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminated {
    Overrun,
    Invalid,
    Interesting(Tag),
}

/// What a predicate body returns. `Failed` is the raised failure condition —
/// the predicate names *what* went wrong; [`classify`] decides the tag and
/// the verdict.
#[derive(Debug, Clone)]
pub enum Outcome {
    Failed(String),
    Terminated(Terminated),
}

impl From<Terminated> for Outcome {
    fn from(t: Terminated) -> Self {
        Outcome::Terminated(t)
    }
}

/// A nested, nameable span in the draw trace bracketing a combinator's work
///. `parent` lets passes such as adjacent-block-reorder find siblings
/// without walking a real tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExampleRegion {
    pub label: &'static str,
    pub start: usize,
    pub end: usize,
    pub parent: Option<usize>,
}

impl ExampleRegion {
    pub fn len(&self) -> usize {
        self.end - self.start
    }
}

struct OpenFrame {
    id: usize,
    label: &'static str,
    start: usize,
    parent_id: Option<usize>,
}

/// A closed region before parent ids have been resolved to final indices.
struct RawRegion {
    id: usize,
    parent_id: Option<usize>,
    region: ExampleRegion,
}

/// Per-predicate-invocation execution context.
pub struct TestCase {
    source: Vec<u8>,
    cursor: usize,
    recorded: Buffer,
    open: Vec<OpenFrame>,
    next_id: usize,
    regions: Vec<RawRegion>,
    verdict: Verdict,
}

impl TestCase {
    pub fn new(source: &[u8]) -> Self {
        Self {
            source: source.to_vec(),
            cursor: 0,
            recorded: Buffer::new(),
            open: Vec::new(),
            next_id: 0,
            regions: Vec::new(),
            verdict: Verdict::Valid,
        }
    }

    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.source.len() - self.cursor
    }

    /// Consume `n` bytes at the cursor, recording exactly one block over
    /// them. Terminates with `OVERRUN` if fewer than `n` bytes remain.
    pub fn draw_bytes(&mut self, n: usize) -> Result<Vec<u8>, Terminated> {
        if self.remaining() < n {
            self.verdict = Verdict::Overrun;
            return Err(Terminated::Overrun);
        }
        let start = self.cursor;
        let end = self.cursor + n;
        let bytes = self.source[start..end].to_vec();
        self.recorded.push_block(&bytes);
        self.cursor = end;
        Ok(bytes)
    }

    /// Open a structural region tied to the combinator that calls it.
    pub fn start_example(&mut self, label: &'static str) {
        let id = self.next_id;
        self.next_id += 1;
        let parent_id = self.open.last().map(|f| f.id);
        self.open.push(OpenFrame { id, label, start: self.cursor, parent_id });
    }

    /// Close the most recently opened region. `label` must match the label
    /// passed to the corresponding `start_example` (checked with
    /// `debug_assert!` — regions are well-nested by construction since every
    /// core combinator always pairs its own start/stop calls).
    pub fn stop_example(&mut self, label: &'static str) {
        let frame = self.open.pop().expect("stop_example with no matching start_example");
        debug_assert_eq!(frame.label, label, "example regions must be well-nested");
        self.regions.push(RawRegion {
            id: frame.id,
            parent_id: frame.parent_id,
            region: ExampleRegion { label: frame.label, start: frame.start, end: self.cursor, parent: None },
        });
    }

    /// Terminate with `INVALID` (used by filter combinators).
    pub fn mark_invalid(&mut self) -> Terminated {
        self.verdict = Verdict::Invalid;
        Terminated::Invalid
    }

    /// Terminate with `INTERESTING(tag)`.
    pub fn mark_interesting(&mut self, tag: Tag) -> Terminated {
        self.verdict = Verdict::Interesting(tag);
        Terminated::Interesting(tag)
    }

    /// Consume the `TestCase`, producing the recorded buffer, its verdict,
    /// and the reconstructed example-region list.
    fn finish(mut self) -> (Buffer, Verdict, Vec<ExampleRegion>) {
        // Any still-open frames belong to a draw that overran or a predicate
        // that stopped early; they never produced a matching `stop_example`
        // and are simply dropped (their partial span carries no structural
        // information a shrink pass could use).
        self.open.clear();

        // Regions close in post-order (innermost first), so a parent's id
        // is known before its own record exists. Map id -> final index once
        // all regions are in hand, then resolve every parent reference.
        let id_to_index: std::collections::HashMap<usize, usize> =
            self.regions.iter().enumerate().map(|(i, r)| (r.id, i)).collect();

        let resolved = self
            .regions
            .into_iter()
            .map(|r| {
                let parent = r.parent_id.and_then(|pid| id_to_index.get(&pid).copied());
                ExampleRegion { parent, ..r.region }
            })
            .collect();

        (self.recorded, self.verdict, resolved)
    }
}

pub(crate) fn hash_message(message: &str) -> Tag {
    use sha1::{Digest, Sha1};
    let digest = Sha1::digest(message.as_bytes());
    u64::from_be_bytes(digest[0..8].try_into().expect("sha1 digest is 20 bytes"))
}

/// Run `predicate` against `source` bytes, producing the recorded buffer,
/// the verdict, the example-region structure, and — when the predicate
/// raised a named failure — the message that was hashed into its tag. The
/// message is what lets a caller report *what* failed, not just its tag
///.
pub fn classify_detailed<F>(
    source: &[u8],
    predicate: F,
) -> (Buffer, Verdict, Vec<ExampleRegion>, Option<String>)
where
    F: FnOnce(&mut TestCase) -> Result<(), Outcome>,
{
    let mut tc = TestCase::new(source);
    let mut message = None;
    match predicate(&mut tc) {
        Ok(()) => {}
        Err(Outcome::Terminated(_)) => {}
        Err(Outcome::Failed(msg)) => {
            tc.verdict = Verdict::Interesting(hash_message(&msg));
            message = Some(msg);
        }
    }
    let (buffer, verdict, regions) = tc.finish();
    (buffer, verdict, regions, message)
}

/// Run `predicate` against `source` bytes, producing the recorded buffer,
/// the verdict, and the example-region structure.
///
/// This is the harness boundary: a `Failed` outcome is mapped to
/// `INTERESTING(tag)` by hashing the message; everything else is whatever
/// verdict the `TestCase` already recorded. Thin wrapper over
/// [`classify_detailed`] for callers that don't need the failure message.
pub fn classify<F>(source: &[u8], predicate: F) -> (Buffer, Verdict, Vec<ExampleRegion>)
where
    F: FnOnce(&mut TestCase) -> Result<(), Outcome>,
{
    let (buffer, verdict, regions, _message) = classify_detailed(source, predicate);
    (buffer, verdict, regions)
}
