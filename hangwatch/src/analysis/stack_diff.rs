//! Consecutive-sample stack diffing.
//!
//! Two samples of the same thread are compared from the outermost frame
//! inwards. The deepest frame they share is the *crux*: whatever happened
//! between the samples happened at or below it, so the elapsed time is
//! credited there. Frames of the previous sample deeper than the crux have
//! returned and are retired into it.
//!
//! ```text
//!  height   previous   current
//!    0        A          A
//!    1        B          B      <- crux
//!    2        C          D      C retired, D fresh
//! ```
//!
//! Stacks are stored innermost-first, so height `h` of a stack of length
//! `n` is index `n - 1 - h`.

use std::ops::Range;

use super::synopsis::ProfileSynopsis;
use crate::classification::RiskClassifier;
use crate::domain::StackFrame;

/// Frame at `height` (0 = outermost) of an innermost-first stack.
pub fn frame_at_height(stack: &[StackFrame], height: usize) -> Option<&StackFrame> {
    stack.len().checked_sub(height + 1).map(|index| &stack[index])
}

/// Structural comparison of two samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackDiff {
    /// The samples share frames at heights `0..=crux`.
    Shared { crux: usize, previous_len: usize, current_len: usize },
    /// Not even the outermost frames match (or a sample is empty).
    Disjoint,
}

impl StackDiff {
    #[must_use]
    pub fn compute(previous: &[StackFrame], current: &[StackFrame]) -> Self {
        let shared = previous
            .iter()
            .rev()
            .zip(current.iter().rev())
            .take_while(|(p, c)| p == c)
            .count();
        match shared.checked_sub(1) {
            Some(crux) => Self::Shared {
                crux,
                previous_len: previous.len(),
                current_len: current.len(),
            },
            None => Self::Disjoint,
        }
    }

    pub fn crux(&self) -> Option<usize> {
        match self {
            Self::Shared { crux, .. } => Some(*crux),
            Self::Disjoint => None,
        }
    }

    /// Heights of previous-sample frames that have returned.
    pub fn retired_heights(&self) -> Range<usize> {
        match *self {
            Self::Shared { crux, previous_len, .. } => crux + 1..previous_len,
            Self::Disjoint => 0..0,
        }
    }

    /// Heights of current-sample frames not present in the previous sample.
    pub fn fresh_heights(&self) -> Range<usize> {
        match *self {
            Self::Shared { crux, current_len, .. } => crux + 1..current_len,
            Self::Disjoint => 0..0,
        }
    }
}

/// What applying a diff changed besides the call tree itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffEffects {
    /// Time credited to a native crux
    pub native_nanos: u64,
    /// A fresh frame belongs to the application
    pub application_code_seen: bool,
    /// Retired nodes folded into the crux
    pub retired: usize,
    /// A retired node had no crux to fold into
    pub missing_crux: bool,
}

/// Credit `delta_nanos` to the crux and retire everything the previous
/// sample had below it. Returns `None` for a [`StackDiff::Disjoint`] diff,
/// in which case nothing is touched.
pub fn apply_diff(
    synopsis: &mut ProfileSynopsis,
    previous: &[StackFrame],
    current: &[StackFrame],
    diff: &StackDiff,
    delta_nanos: u64,
    classifier: &RiskClassifier,
    unreasonable_frame_nanos: u64,
) -> Option<DiffEffects> {
    let crux = diff.crux()?;
    let crux_frame = frame_at_height(previous, crux)?;
    let mut effects = DiffEffects::default();

    synopsis.get_or_create(crux, crux_frame, classifier).elapsed_nanos += delta_nanos;
    if crux_frame.native {
        effects.native_nanos = delta_nanos;
    }

    for height in diff.retired_heights() {
        let Some(node) = synopsis.remove(height) else {
            continue;
        };
        effects.retired += 1;
        if !synopsis.record_frame_info(crux, node, unreasonable_frame_nanos) {
            effects.missing_crux = true;
        }
    }

    effects.application_code_seen = diff
        .fresh_heights()
        .filter_map(|height| frame_at_height(current, height))
        .any(|frame| classifier.is_application_code(frame));

    Some(effects)
}
