//! # Shared Data Structures (Introspection ↔ Analysis)
//!
//! Defines the thread-introspection data model shared between the
//! introspection backends (shadow stacks, `/proc`, host-supplied snapshots)
//! and the analysis side of `hangwatch`. Nothing in here knows how a stack
//! was captured; it only describes what was seen.
//!
//! ## Key Types
//!
//! - [`StackFrame`] - One code location in a captured stack
//! - [`ThreadId`] - Identity of a thread as seen by an introspector
//! - [`ThreadState`] - Scheduling state at capture time
//! - [`LockInfo`] / [`MonitorInfo`] - Locks awaited and held
//! - [`ThreadInfo`] - Point-in-time snapshot of one thread
//!
//! With the `serde` feature enabled every type is serializable so snapshots
//! can be exported alongside reports.

use std::fmt;
use std::hash::{Hash, Hasher};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

// ============================================================================
// Thread Identity
// ============================================================================

/// Thread ID
///
/// Assigned by the introspection backend. For the shadow registry this is a
/// registry-local counter, for the `/proc` backend it is the kernel TID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

// ============================================================================
// Stack Frames
// ============================================================================

/// A single frame of a captured stack.
///
/// **Identity**: `(owner, method, native)`. The source file and line are
/// carried for display only. They change between builds of the same code
/// and must never influence stack diffing, so `PartialEq` and `Hash` ignore
/// them.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StackFrame {
    /// Qualified module or type path (e.g. `std::net::TcpStream`)
    pub owner: String,

    /// Function or method name within `owner` (e.g. `read`)
    pub method: String,

    /// True when the frame executes outside managed code (syscalls,
    /// FFI, kernel frames)
    pub native: bool,

    /// Source file, if known
    pub file: Option<String>,

    /// Source line, if known
    pub line: Option<u32>,
}

impl StackFrame {
    /// Create a managed (non-native) frame.
    pub fn new(owner: impl Into<String>, method: impl Into<String>) -> Self {
        Self { owner: owner.into(), method: method.into(), native: false, file: None, line: None }
    }

    /// Create a native frame.
    pub fn native(owner: impl Into<String>, method: impl Into<String>) -> Self {
        Self { native: true, ..Self::new(owner, method) }
    }

    /// Attach display-only source location metadata.
    #[must_use]
    pub fn with_location(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }
}

impl PartialEq for StackFrame {
    fn eq(&self, other: &Self) -> bool {
        self.owner == other.owner && self.method == other.method && self.native == other.native
    }
}

impl Eq for StackFrame {}

impl Hash for StackFrame {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.owner.hash(state);
        self.method.hash(state);
        self.native.hash(state);
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.owner, self.method)?;
        if self.native {
            return write!(f, "(Native Method)");
        }
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "({file}:{line})"),
            (Some(file), None) => write!(f, "({file})"),
            _ => write!(f, "(Unknown Source)"),
        }
    }
}

// ============================================================================
// Thread State
// ============================================================================

/// Scheduling state of a thread at capture time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ThreadState {
    /// Registered but not yet running
    New,
    /// Executing or ready to execute
    #[default]
    Runnable,
    /// Waiting to acquire a monitor held by another thread
    Blocked,
    /// Waiting indefinitely (park, condition wait, channel receive)
    Waiting,
    /// Waiting with a timeout (sleep, timed park)
    TimedWaiting,
    /// Finished
    Terminated,
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Runnable => "RUNNABLE",
            Self::Blocked => "BLOCKED",
            Self::Waiting => "WAITING",
            Self::TimedWaiting => "TIMED_WAITING",
            Self::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Locks
// ============================================================================

/// A lock object: its declared type and an identity unique within the
/// introspected process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LockInfo {
    /// Declared type of the locked resource (e.g. `ui::widget::Button`)
    pub type_name: String,

    /// Backend-assigned identity
    pub identity: u64,
}

impl LockInfo {
    pub fn new(type_name: impl Into<String>, identity: u64) -> Self {
        Self { type_name: type_name.into(), identity }
    }
}

impl fmt::Display for LockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:x}", self.type_name, self.identity)
    }
}

/// A monitor currently held by a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MonitorInfo {
    pub lock: LockInfo,

    /// Index into the owning thread's stack (innermost = 0) of the frame
    /// that acquired the monitor, if known
    pub locked_depth: Option<usize>,

    /// The frame that acquired the monitor, if known
    pub locked_frame: Option<StackFrame>,
}

impl MonitorInfo {
    pub fn new(lock: LockInfo) -> Self {
        Self { lock, locked_depth: None, locked_frame: None }
    }

    #[must_use]
    pub fn at(mut self, depth: usize, frame: StackFrame) -> Self {
        self.locked_depth = Some(depth);
        self.locked_frame = Some(frame);
        self
    }
}

impl fmt::Display for MonitorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.lock.fmt(f)
    }
}

// ============================================================================
// Thread Snapshot
// ============================================================================

/// Point-in-time snapshot of one thread.
///
/// Backends fill in what they can: a `/proc` snapshot has no lock detail, a
/// host-supplied snapshot may have no counters. Missing data is `None` or
/// empty, never an error.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: String,
    pub state: ThreadState,

    /// Innermost frame first
    pub stack: Vec<StackFrame>,

    /// Lock this thread is blocked on or waiting for
    pub lock: Option<LockInfo>,

    /// Owner of `lock`, if owned
    pub lock_owner_id: Option<ThreadId>,
    pub lock_owner_name: Option<String>,

    /// Monitors held (only populated when lock detail was requested)
    pub locked_monitors: Vec<MonitorInfo>,

    /// Ownable synchronizers held (only populated when lock detail was
    /// requested)
    pub locked_synchronizers: Vec<LockInfo>,

    pub in_native: bool,
    pub suspended: bool,

    /// Number of times the thread blocked on a contended monitor
    pub blocked_count: u64,
    /// Total time blocked, when contention monitoring is enabled
    pub blocked_time_ms: Option<u64>,
    /// Number of times the thread waited (park, condition, receive)
    pub waited_count: u64,
    /// Total time waited, when contention monitoring is enabled
    pub waited_time_ms: Option<u64>,
}

impl ThreadInfo {
    /// Create a runnable snapshot with no stack, locks or counters.
    pub fn new(id: ThreadId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            state: ThreadState::Runnable,
            stack: Vec::new(),
            lock: None,
            lock_owner_id: None,
            lock_owner_name: None,
            locked_monitors: Vec::new(),
            locked_synchronizers: Vec::new(),
            in_native: false,
            suspended: false,
            blocked_count: 0,
            blocked_time_ms: None,
            waited_count: 0,
            waited_time_ms: None,
        }
    }

    /// Rendered lock name (`type@identity`), as shown in reports.
    #[must_use]
    pub fn lock_name(&self) -> Option<String> {
        self.lock.as_ref().map(ToString::to_string)
    }

    /// Copy of this snapshot with lock detail stripped, as returned when
    /// a caller does not ask for monitors and synchronizers.
    #[must_use]
    pub fn without_lock_detail(&self) -> Self {
        Self { locked_monitors: Vec::new(), locked_synchronizers: Vec::new(), ..self.clone() }
    }
}
