//! Thread introspection backends
//!
//! The analyzers never capture stacks themselves. They ask a
//! [`ThreadIntrospector`] for point-in-time views of threads, and every
//! answer may be partial: a stack can be unavailable, a thread can exit
//! between listing and inspection, a backend may know nothing about locks.
//!
//! Backends:
//! - [`shadow`]: in-process shadow stacks and monitored mutexes
//! - [`proc`]: Linux `/proc` view of another (or this) process
//! - [`snapshot`]: host- or test-supplied fixed snapshots

pub mod proc;
pub mod shadow;
pub mod snapshot;

pub use proc::ProcIntrospector;
pub use shadow::{FrameGuard, MonitoredGuard, MonitoredMutex, ShadowRegistry, ThreadHandle};
pub use snapshot::SnapshotIntrospector;

use crate::analysis::deadlock;
use crate::domain::{IntrospectionError, StackFrame, ThreadId, ThreadInfo};

/// Read-only access to the threads of the monitored process.
pub trait ThreadIntrospector: Send + Sync {
    /// Identity of the calling thread.
    ///
    /// # Errors
    /// [`IntrospectionError::UnregisteredThread`] if the backend does not
    /// know the caller.
    fn current_thread(&self) -> Result<ThreadId, IntrospectionError>;

    /// Stack of `tid`, innermost frame first. An empty stack is a valid
    /// answer and means "nothing to sample".
    ///
    /// # Errors
    /// Returns an error if the thread is gone or its stack cannot be read.
    fn stack_of(&self, tid: ThreadId) -> Result<Vec<StackFrame>, IntrospectionError>;

    /// Every live thread, in backend order.
    fn all_thread_ids(&self) -> Vec<ThreadId>;

    /// Snapshot of one thread. Monitors and synchronizers are only filled
    /// in when `with_locks` is set.
    ///
    /// # Errors
    /// Returns an error if the thread is gone or cannot be read.
    fn thread_info(&self, tid: ThreadId, with_locks: bool)
        -> Result<ThreadInfo, IntrospectionError>;

    /// Snapshot of every thread that could still be read.
    fn thread_infos(&self, with_locks: bool) -> Vec<ThreadInfo> {
        self.all_thread_ids()
            .into_iter()
            .filter_map(|tid| match self.thread_info(tid, with_locks) {
                Ok(info) => Some(info),
                Err(e) => {
                    log::debug!("Skipping {tid}: {e}");
                    None
                }
            })
            .collect()
    }

    /// Threads caught in a monitor wait cycle.
    fn find_monitor_deadlocked_threads(&self) -> Vec<ThreadId> {
        deadlock::find_deadlocked_threads(&self.thread_infos(false))
    }

    /// Whether blocked/waited time accounting can be turned on.
    fn contention_monitoring_supported(&self) -> bool {
        false
    }

    /// Turn on blocked/waited time accounting.
    ///
    /// # Errors
    /// [`IntrospectionError::Unsupported`] unless the backend supports it.
    fn enable_contention_monitoring(&self) -> Result<(), IntrospectionError> {
        Err(IntrospectionError::Unsupported("contention monitoring"))
    }
}
