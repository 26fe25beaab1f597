//! Fixed-snapshot introspector.
//!
//! Answers every query from thread snapshots the owner installs up front
//! and swaps between scans. Hosts that capture stacks through their own
//! means feed it directly; tests use it to script exact sample sequences.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::ThreadIntrospector;
use crate::domain::{IntrospectionError, StackFrame, ThreadId, ThreadInfo};

#[derive(Debug, Default)]
struct SnapshotState {
    threads: BTreeMap<ThreadId, ThreadInfo>,
    current: Option<ThreadId>,
    contention_supported: bool,
    contention_enabled: bool,
}

/// Introspector over installed [`ThreadInfo`] snapshots.
#[derive(Debug, Default)]
pub struct SnapshotIntrospector {
    state: Mutex<SnapshotState>,
}

impl SnapshotIntrospector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise contention monitoring support.
    #[must_use]
    pub fn with_contention_support(self) -> Self {
        self.lock().contention_supported = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SnapshotState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Thread reported by [`ThreadIntrospector::current_thread`].
    pub fn set_current(&self, tid: ThreadId) {
        self.lock().current = Some(tid);
    }

    /// Install or replace a full snapshot.
    pub fn set_thread(&self, info: ThreadInfo) {
        self.lock().threads.insert(info.id, info);
    }

    /// Replace only the stack (innermost first) of `tid`, creating a bare
    /// runnable thread if none is installed.
    pub fn set_stack(&self, tid: ThreadId, stack: Vec<StackFrame>) {
        let mut state = self.lock();
        state
            .threads
            .entry(tid)
            .or_insert_with(|| ThreadInfo::new(tid, format!("thread-{}", tid.0)))
            .stack = stack;
    }

    /// Modify an installed snapshot in place. Returns false if absent.
    pub fn update_thread(&self, tid: ThreadId, f: impl FnOnce(&mut ThreadInfo)) -> bool {
        match self.lock().threads.get_mut(&tid) {
            Some(info) => {
                f(info);
                true
            }
            None => false,
        }
    }

    pub fn remove_thread(&self, tid: ThreadId) {
        self.lock().threads.remove(&tid);
    }

    pub fn contention_monitoring_enabled(&self) -> bool {
        self.lock().contention_enabled
    }
}

impl ThreadIntrospector for SnapshotIntrospector {
    fn current_thread(&self) -> Result<ThreadId, IntrospectionError> {
        self.lock().current.ok_or(IntrospectionError::UnregisteredThread)
    }

    fn stack_of(&self, tid: ThreadId) -> Result<Vec<StackFrame>, IntrospectionError> {
        self.lock()
            .threads
            .get(&tid)
            .map(|info| info.stack.clone())
            .ok_or(IntrospectionError::StackUnavailable(tid))
    }

    fn all_thread_ids(&self) -> Vec<ThreadId> {
        self.lock().threads.keys().copied().collect()
    }

    fn thread_info(
        &self,
        tid: ThreadId,
        with_locks: bool,
    ) -> Result<ThreadInfo, IntrospectionError> {
        let state = self.lock();
        let info = state.threads.get(&tid).ok_or(IntrospectionError::ThreadNotFound(tid))?;
        let mut info = if with_locks { info.clone() } else { info.without_lock_detail() };
        if !state.contention_enabled {
            info.blocked_time_ms = None;
            info.waited_time_ms = None;
        }
        Ok(info)
    }

    fn contention_monitoring_supported(&self) -> bool {
        self.lock().contention_supported
    }

    fn enable_contention_monitoring(&self) -> Result<(), IntrospectionError> {
        let mut state = self.lock();
        if !state.contention_supported {
            return Err(IntrospectionError::Unsupported("contention monitoring"));
        }
        state.contention_enabled = true;
        Ok(())
    }
}
