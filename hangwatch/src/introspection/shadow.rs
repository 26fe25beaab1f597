//! In-process shadow stacks.
//!
//! Threads that want to be visible to the watchdog register with a
//! [`ShadowRegistry`] and describe what they are doing as they go:
//!
//! ```text
//! let me = registry.register_current("dispatch");
//! let _run = me.enter("app::editor", "save");        // pushed until dropped
//! let doc = document.lock(&me);                      // MonitoredMutex
//! me.wait_in("std::thread", "park", || rx.recv());   // waiting, counted
//! ```
//!
//! The registry never pauses a thread to look at it. Every frame push, lock
//! acquisition and wait updates a small per-thread record under its own
//! mutex, and the scanners copy those records out. A snapshot is therefore
//! always a consistent view of one thread, but different threads in one
//! dump may be captured microseconds apart.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Instant;

use super::ThreadIntrospector;
use crate::domain::{
    IntrospectionError, LockInfo, MonitorInfo, StackFrame, ThreadId, ThreadInfo, ThreadState,
    NANOS_PER_MILLI,
};

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[allow(clippy::cast_possible_truncation)]
fn elapsed_nanos(since: Instant) -> u64 {
    since.elapsed().as_nanos() as u64
}

// =============================================================================
// PER-THREAD RECORD
// =============================================================================

#[derive(Debug, Clone)]
struct HeldMonitor {
    lock: LockInfo,
    /// Number of frames on the stack when the monitor was taken
    depth: usize,
}

#[derive(Debug, Clone, Default)]
struct ShadowState {
    /// Outermost frame first
    frames: Vec<StackFrame>,
    state: ThreadState,
    waiting_on: Option<LockInfo>,
    held: Vec<HeldMonitor>,
    blocked_count: u64,
    blocked_nanos: u64,
    waited_count: u64,
    waited_nanos: u64,
}

#[derive(Debug)]
struct ShadowThread {
    id: ThreadId,
    name: String,
    state: Mutex<ShadowState>,
}

impl ShadowThread {
    fn update<R>(&self, f: impl FnOnce(&mut ShadowState) -> R) -> R {
        f(&mut lock_recover(&self.state))
    }

    fn snapshot(&self) -> ShadowState {
        lock_recover(&self.state).clone()
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

#[derive(Debug, Default)]
struct RegistryInner {
    next_thread: AtomicU64,
    next_lock: AtomicU64,
    threads: Mutex<BTreeMap<ThreadId, Arc<ShadowThread>>>,
    os_threads: Mutex<HashMap<std::thread::ThreadId, ThreadId>>,
    /// Lock identity -> current owner
    lock_owners: Mutex<HashMap<u64, ThreadId>>,
    contention_enabled: AtomicBool,
}

impl RegistryInner {
    fn thread(&self, tid: ThreadId) -> Option<Arc<ShadowThread>> {
        lock_recover(&self.threads).get(&tid).cloned()
    }

    fn owner_of(&self, identity: u64) -> Option<ThreadId> {
        lock_recover(&self.lock_owners).get(&identity).copied()
    }
}

/// Registry of shadow-instrumented threads. Cheap to clone; clones share
/// the same threads.
#[derive(Debug, Clone, Default)]
pub struct ShadowRegistry {
    inner: Arc<RegistryInner>,
}

impl ShadowRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the calling thread. The thread stays visible until the
    /// returned handle is dropped.
    pub fn register_current(&self, name: impl Into<String>) -> ThreadHandle {
        let id = ThreadId(self.inner.next_thread.fetch_add(1, Ordering::SeqCst) + 1);
        let thread =
            Arc::new(ShadowThread { id, name: name.into(), state: Mutex::new(ShadowState::default()) });
        let os_id = std::thread::current().id();

        lock_recover(&self.inner.threads).insert(id, Arc::clone(&thread));
        lock_recover(&self.inner.os_threads).insert(os_id, id);
        log::debug!("Registered shadow thread {id} ({})", thread.name);

        ThreadHandle { registry: Arc::clone(&self.inner), thread, os_id }
    }

    /// Create a mutex whose ownership and waiters are visible to scans.
    pub fn mutex<T>(&self, type_name: impl Into<String>, value: T) -> MonitoredMutex<T> {
        let identity = self.inner.next_lock.fetch_add(1, Ordering::SeqCst) + 1;
        MonitoredMutex { lock: LockInfo::new(type_name, identity), inner: Mutex::new(value) }
    }

    pub fn thread_count(&self) -> usize {
        lock_recover(&self.inner.threads).len()
    }

    pub fn contention_monitoring_enabled(&self) -> bool {
        self.inner.contention_enabled.load(Ordering::Relaxed)
    }
}

impl ThreadIntrospector for ShadowRegistry {
    fn current_thread(&self) -> Result<ThreadId, IntrospectionError> {
        lock_recover(&self.inner.os_threads)
            .get(&std::thread::current().id())
            .copied()
            .ok_or(IntrospectionError::UnregisteredThread)
    }

    fn stack_of(&self, tid: ThreadId) -> Result<Vec<StackFrame>, IntrospectionError> {
        let thread = self.inner.thread(tid).ok_or(IntrospectionError::StackUnavailable(tid))?;
        let state = lock_recover(&thread.state);
        Ok(state.frames.iter().rev().cloned().collect())
    }

    fn all_thread_ids(&self) -> Vec<ThreadId> {
        lock_recover(&self.inner.threads).keys().copied().collect()
    }

    fn thread_info(
        &self,
        tid: ThreadId,
        with_locks: bool,
    ) -> Result<ThreadInfo, IntrospectionError> {
        let thread = self.inner.thread(tid).ok_or(IntrospectionError::ThreadNotFound(tid))?;
        let snapshot = thread.snapshot();
        let stack: Vec<StackFrame> = snapshot.frames.iter().rev().cloned().collect();

        let mut info = ThreadInfo::new(tid, thread.name.clone());
        info.state = snapshot.state;
        info.in_native = stack.first().is_some_and(|f| f.native);
        info.blocked_count = snapshot.blocked_count;
        info.waited_count = snapshot.waited_count;
        if self.contention_monitoring_enabled() {
            info.blocked_time_ms = Some(snapshot.blocked_nanos / NANOS_PER_MILLI);
            info.waited_time_ms = Some(snapshot.waited_nanos / NANOS_PER_MILLI);
        }

        if let Some(lock) = snapshot.waiting_on {
            if let Some(owner) = self.inner.owner_of(lock.identity).filter(|o| *o != tid) {
                info.lock_owner_id = Some(owner);
                info.lock_owner_name = self.inner.thread(owner).map(|t| t.name.clone());
            }
            info.lock = Some(lock);
        }

        if with_locks {
            // Most recently acquired first, like the stack
            info.locked_monitors = snapshot
                .held
                .iter()
                .rev()
                .map(|held| {
                    let monitor = MonitorInfo::new(held.lock.clone());
                    if held.depth == 0 || held.depth > stack.len() {
                        return monitor;
                    }
                    let index = stack.len() - held.depth;
                    monitor.at(index, stack[index].clone())
                })
                .collect();
        }
        info.stack = stack;
        Ok(info)
    }

    fn contention_monitoring_supported(&self) -> bool {
        true
    }

    fn enable_contention_monitoring(&self) -> Result<(), IntrospectionError> {
        self.inner.contention_enabled.store(true, Ordering::Relaxed);
        Ok(())
    }
}

// =============================================================================
// THREAD HANDLE AND FRAMES
// =============================================================================

/// A registered thread. Owned by the thread it describes.
#[derive(Debug)]
pub struct ThreadHandle {
    registry: Arc<RegistryInner>,
    thread: Arc<ShadowThread>,
    os_id: std::thread::ThreadId,
}

impl ThreadHandle {
    pub fn id(&self) -> ThreadId {
        self.thread.id
    }

    pub fn name(&self) -> &str {
        &self.thread.name
    }

    /// Push a managed frame until the guard drops.
    pub fn enter(&self, owner: &str, method: &str) -> FrameGuard<'_> {
        self.enter_frame(StackFrame::new(owner, method))
    }

    /// Push a native frame until the guard drops.
    pub fn enter_native(&self, owner: &str, method: &str) -> FrameGuard<'_> {
        self.enter_frame(StackFrame::native(owner, method))
    }

    pub fn enter_frame(&self, frame: StackFrame) -> FrameGuard<'_> {
        let depth = self.thread.update(|s| {
            s.frames.push(frame);
            s.frames.len() - 1
        });
        FrameGuard { thread: &self.thread, depth }
    }

    /// Run `f` as a counted wait inside a native `owner::method` frame.
    pub fn wait_in<R>(&self, owner: &str, method: &str, f: impl FnOnce() -> R) -> R {
        let _frame = self.enter_native(owner, method);
        let _wait = WaitRecord::begin(&self.thread);
        f()
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        self.thread.update(|s| s.state = ThreadState::Terminated);
        lock_recover(&self.registry.os_threads).remove(&self.os_id);
        lock_recover(&self.registry.threads).remove(&self.thread.id);
    }
}

/// Pops its frame (and anything pushed above it) on drop.
#[derive(Debug)]
pub struct FrameGuard<'a> {
    thread: &'a ShadowThread,
    depth: usize,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        let depth = self.depth;
        self.thread.update(|s| s.frames.truncate(depth));
    }
}

struct WaitRecord<'a> {
    thread: &'a ShadowThread,
    started: Instant,
    previous: ThreadState,
}

impl<'a> WaitRecord<'a> {
    fn begin(thread: &'a ShadowThread) -> Self {
        let previous = thread.update(|s| {
            s.waited_count += 1;
            std::mem::replace(&mut s.state, ThreadState::Waiting)
        });
        Self { thread, started: Instant::now(), previous }
    }
}

impl Drop for WaitRecord<'_> {
    fn drop(&mut self) {
        let waited = elapsed_nanos(self.started);
        let previous = self.previous;
        self.thread.update(|s| {
            s.waited_nanos += waited;
            s.state = previous;
        });
    }
}

// =============================================================================
// MONITORED MUTEX
// =============================================================================

/// A mutex that reports its owner and its waiters to the registry.
#[derive(Debug)]
pub struct MonitoredMutex<T> {
    lock: LockInfo,
    inner: Mutex<T>,
}

impl<T> MonitoredMutex<T> {
    pub fn lock_info(&self) -> &LockInfo {
        &self.lock
    }

    /// Acquire on behalf of `handle`'s thread. A contended acquisition
    /// shows the thread as blocked on this lock until it gets it.
    pub fn lock<'a>(&'a self, handle: &'a ThreadHandle) -> MonitoredGuard<'a, T> {
        let guard = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                handle.thread.update(|s| {
                    s.state = ThreadState::Blocked;
                    s.waiting_on = Some(self.lock.clone());
                    s.blocked_count += 1;
                });
                let started = Instant::now();
                let guard = lock_recover(&self.inner);
                let blocked = elapsed_nanos(started);
                handle.thread.update(|s| {
                    s.state = ThreadState::Runnable;
                    s.waiting_on = None;
                    s.blocked_nanos += blocked;
                });
                guard
            }
        };

        lock_recover(&handle.registry.lock_owners).insert(self.lock.identity, handle.id());
        handle.thread.update(|s| {
            let depth = s.frames.len();
            s.held.push(HeldMonitor { lock: self.lock.clone(), depth });
        });

        MonitoredGuard { guard, lock: &self.lock, handle }
    }
}

/// Access to a [`MonitoredMutex`]'s data. Ownership is cleared before the
/// underlying lock is released.
pub struct MonitoredGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    lock: &'a LockInfo,
    handle: &'a ThreadHandle,
}

impl<T> std::ops::Deref for MonitoredGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> std::ops::DerefMut for MonitoredGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for MonitoredGuard<'_, T> {
    fn drop(&mut self) {
        let identity = self.lock.identity;
        self.handle.thread.update(|s| {
            if let Some(pos) = s.held.iter().rposition(|h| h.lock.identity == identity) {
                s.held.remove(pos);
            }
        });
        let mut owners = lock_recover(&self.handle.registry.lock_owners);
        if owners.get(&identity) == Some(&self.handle.id()) {
            owners.remove(&identity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_frames_push_and_pop() {
        let registry = ShadowRegistry::new();
        let me = registry.register_current("main");
        {
            let _outer = me.enter("app::loop", "run");
            let _inner = me.enter_native("libc", "read");
            let stack = registry.stack_of(me.id()).unwrap();
            assert_eq!(stack[0], StackFrame::native("libc", "read"));
            assert_eq!(stack[1], StackFrame::new("app::loop", "run"));
        }
        assert!(registry.stack_of(me.id()).unwrap().is_empty());
    }

    #[test]
    fn test_current_thread_and_unregister() {
        let registry = ShadowRegistry::new();
        assert!(registry.current_thread().is_err());
        let me = registry.register_current("main");
        assert_eq!(registry.current_thread().unwrap(), me.id());
        let id = me.id();
        drop(me);
        assert!(registry.current_thread().is_err());
        assert!(registry.thread_info(id, false).is_err());
        assert_eq!(registry.thread_count(), 0);
    }

    #[test]
    fn test_held_monitor_depth() {
        let registry = ShadowRegistry::new();
        let cache = registry.mutex("app::Cache", 0_u32);
        let me = registry.register_current("main");
        let _run = me.enter("app::loop", "run");
        let _fill = me.enter("app::cache", "fill");
        let mut guard = cache.lock(&me);
        *guard += 1;
        let _deeper = me.enter("app::cache", "compute");

        let info = registry.thread_info(me.id(), true).unwrap();
        assert_eq!(info.locked_monitors.len(), 1);
        let monitor = &info.locked_monitors[0];
        assert_eq!(monitor.locked_depth, Some(1));
        assert_eq!(monitor.locked_frame, Some(StackFrame::new("app::cache", "fill")));
    }

    #[test]
    fn test_lock_released_on_guard_drop() {
        let registry = ShadowRegistry::new();
        let cache = registry.mutex("app::Cache", ());
        let me = registry.register_current("main");
        drop(cache.lock(&me));
        assert!(registry.thread_info(me.id(), true).unwrap().locked_monitors.is_empty());
        assert_eq!(registry.inner.owner_of(cache.lock_info().identity), None);
    }

    #[test]
    fn test_blocked_thread_names_owner() {
        let registry = ShadowRegistry::new();
        let shared = Arc::new(registry.mutex("ui::widget::Canvas", ()));
        let me = registry.register_current("holder");
        let held = shared.lock(&me);

        let (tid_tx, tid_rx) = mpsc::channel();
        let waiter = {
            let registry = registry.clone();
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                let handle = registry.register_current("waiter");
                tid_tx.send(handle.id()).unwrap();
                drop(shared.lock(&handle));
            })
        };

        let waiter_id = tid_rx.recv().unwrap();
        let mut blocked = None;
        for _ in 0..200 {
            let info = registry.thread_info(waiter_id, false).unwrap();
            if info.state == ThreadState::Blocked {
                blocked = Some(info);
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let blocked = blocked.expect("waiter never blocked");
        assert_eq!(blocked.lock_owner_id, Some(me.id()));
        assert_eq!(blocked.lock_owner_name.as_deref(), Some("holder"));
        assert_eq!(blocked.blocked_count, 1);

        drop(held);
        waiter.join().unwrap();
    }

    #[test]
    fn test_wait_in_counts_and_restores() {
        let registry = ShadowRegistry::new();
        registry.enable_contention_monitoring().unwrap();
        let me = registry.register_current("main");
        let value = me.wait_in("std::thread", "park", || {
            let info = registry.thread_info(me.id(), false).unwrap();
            assert_eq!(info.state, ThreadState::Waiting);
            assert!(info.in_native);
            42
        });
        assert_eq!(value, 42);
        let info = registry.thread_info(me.id(), false).unwrap();
        assert_eq!(info.state, ThreadState::Runnable);
        assert_eq!(info.waited_count, 1);
        assert!(info.waited_time_ms.is_some());
    }
}
