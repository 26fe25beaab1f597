//! Domain model for hangwatch
//!
//! This module contains core domain types and errors that provide:
//! - Compile-time safety via newtype pattern
//! - Self-documenting function signatures
//! - Structured error handling

pub mod errors;
pub mod types;

// Re-export common types for convenience
pub use types::{
    DispatchId, HangId, IdAllocator, RiskLevel, NANOS_PER_MICRO, NANOS_PER_MILLI, NANOS_PER_SEC,
};

pub use errors::{ConfigError, IntrospectionError, WatchdogError};

pub use hangwatch_common::{LockInfo, MonitorInfo, StackFrame, ThreadId, ThreadInfo, ThreadState};
