//! Dispatch watchdog runtime
//!
//! - [`hook`]: the host-facing dispatch start/end surface
//! - [`dispatcher`]: in-flight queue and scan thread
//! - [`analyzer`]: per-dispatch sampling, diffing and escalation
//! - [`deadlock_scanner`]: periodic process-wide deadlock check
//! - [`load_feed`]: module-load activity pub/sub
//! - [`timer`]: named periodic background threads

pub mod analyzer;
pub mod deadlock_scanner;
pub mod dispatcher;
pub mod hook;
pub mod load_feed;
pub mod timer;

pub use analyzer::{AnalyzerContext, AnalyzerSummary, DispatchAnalyzer, Escalation, TickOutcome};
pub use deadlock_scanner::DeadlockScanner;
pub use dispatcher::{DispatchWatchdog, WatchdogBuilder};
pub use hook::{DispatchGuard, DispatchHook, DispatchToken};
pub use load_feed::{LoadActivityFeed, Subscription, SubscriptionId};
pub use timer::ScanTimer;
