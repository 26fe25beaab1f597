//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep dispatch IDs and hang IDs from being mixed
//! up, and make escalation code read in terms of risk rather than integers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

pub const NANOS_PER_MICRO: u64 = 1_000;
pub const NANOS_PER_MILLI: u64 = 1_000_000;
pub const NANOS_PER_SEC: u64 = 1_000 * NANOS_PER_MILLI;

/// Dispatch ID
///
/// Position of a dispatch in the sequence of all dispatches seen by one
/// watchdog (1, 2, 3, ...). Excluded startup dispatches still consume IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DispatchId(pub u64);

impl fmt::Display for DispatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hang ID
///
/// Assigned the first time a dispatch is reported as stuck, then carried by
/// every later report about the same dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HangId(pub u64);

impl fmt::Display for HangId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Severity of a finding. Findings below the requested floor are dropped.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Info,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
        }
    }
}

/// Monotonic ID counters shared by every analyzer of one watchdog.
///
/// Both counters start at zero and hand out `1, 2, 3, ...`.
#[derive(Debug, Default)]
pub struct IdAllocator {
    dispatches: AtomicU64,
    hangs: AtomicU64,
}

impl IdAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_dispatch(&self) -> DispatchId {
        DispatchId(self.dispatches.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn next_hang(&self) -> HangId {
        HangId(self.hangs.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Number of hang IDs handed out so far.
    pub fn hang_count(&self) -> u64 {
        self.hangs.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_risk_level_ordering() {
        assert!(RiskLevel::Info < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert_eq!(RiskLevel::default(), RiskLevel::Info);
    }

    #[test]
    fn test_id_allocator_starts_at_one() {
        let ids = IdAllocator::new();
        assert_eq!(ids.next_dispatch(), DispatchId(1));
        assert_eq!(ids.next_dispatch(), DispatchId(2));
        assert_eq!(ids.next_hang(), HangId(1));
        assert_eq!(ids.hang_count(), 1);
    }

    #[test]
    fn test_id_allocator_is_unique_across_threads() {
        let ids = Arc::new(IdAllocator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || (0..250).map(|_| ids.next_hang().0).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1000);
        assert_eq!(all.last(), Some(&1000));
    }

    #[test]
    fn test_display() {
        assert_eq!(DispatchId(7).to_string(), "#7");
        assert_eq!(RiskLevel::Medium.to_string(), "MEDIUM");
    }
}
