//! Analysis logic for stack samples and thread snapshots
//!
//! Pure, synchronous building blocks used by the watchdog:
//! - [`synopsis`]: per-dispatch call tree with retirement and demotion
//! - [`stack_diff`]: consecutive-sample comparison and time crediting
//! - [`contention`]: full-thread scan for lock contention risks
//! - [`deadlock`]: lock-wait cycle detection

pub mod contention;
pub mod deadlock;
pub mod stack_diff;
pub mod synopsis;

pub use contention::{ContentionReport, ContentionRequest, ContentionScanner};
pub use deadlock::{find_deadlocked_threads, report_deadlocks};
pub use stack_diff::{apply_diff, frame_at_height, DiffEffects, StackDiff};
pub use synopsis::{CallTreeNode, ProfileSynopsis};
