//! Demo host: a single-threaded dispatch loop.
//!
//! Events arrive over a channel and run one at a time on the dispatch
//! thread, each wrapped in a watchdog dispatch. The loop describes itself
//! to a [`ShadowRegistry`] so that, between events, its stack reads
//!
//! ```text
//! std::thread::park                       (native, waiting)
//! crossbeam_channel::Receiver::recv
//! hangwatch::host::DispatchLoop::next_event
//! hangwatch::host::DispatchLoop::run
//! ```
//!
//! which is exactly the default idle-wait pattern.

pub mod workload;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::introspection::{ShadowRegistry, ThreadHandle};
use crate::watchdog::{DispatchWatchdog, LoadActivityFeed};

const LOOP_OWNER: &str = "hangwatch::host::DispatchLoop";

pub type Task = Box<dyn FnOnce(&DispatchContext<'_>) + Send>;

/// One unit of work for the dispatch thread.
pub struct HostEvent {
    pub descriptor: String,
    pub task: Task,
}

impl HostEvent {
    pub fn new(
        descriptor: impl Into<String>,
        task: impl FnOnce(&DispatchContext<'_>) + Send + 'static,
    ) -> Self {
        Self { descriptor: descriptor.into(), task: Box::new(task) }
    }
}

/// What a running task can reach.
pub struct DispatchContext<'a> {
    host: &'a DispatchLoop,
    thread: &'a ThreadHandle,
}

impl DispatchContext<'_> {
    pub fn thread(&self) -> &ThreadHandle {
        self.thread
    }

    pub fn registry(&self) -> &ShadowRegistry {
        &self.host.registry
    }

    pub fn load_feed(&self) -> &LoadActivityFeed {
        self.host.watchdog.load_feed()
    }

    /// Pump up to `max_events` further events from inside this one, like a
    /// modal dialog does.
    pub fn run_nested(&self, max_events: usize) -> usize {
        let _modal = self.thread.enter("app::ui::Dialog", "run_modal");
        self.host.pump(self.thread, Some(max_events))
    }
}

pub struct DispatchLoop {
    rx: Receiver<HostEvent>,
    registry: ShadowRegistry,
    watchdog: Arc<DispatchWatchdog>,
    /// Including events pumped by nested loops
    dispatched: AtomicUsize,
}

impl DispatchLoop {
    pub fn new(
        rx: Receiver<HostEvent>,
        registry: ShadowRegistry,
        watchdog: Arc<DispatchWatchdog>,
    ) -> Self {
        Self { rx, registry, watchdog, dispatched: AtomicUsize::new(0) }
    }

    /// Start a loop on its own thread named `name`.
    pub fn spawn(
        name: &str,
        registry: ShadowRegistry,
        watchdog: Arc<DispatchWatchdog>,
    ) -> Result<HostHandle> {
        let (tx, rx) = unbounded();
        let host = Self::new(rx, registry, watchdog);
        let thread_name = name.to_string();
        let thread = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || host.run(&thread_name))
            .with_context(|| format!("Failed to spawn dispatch thread '{name}'"))?;
        Ok(HostHandle { tx, thread })
    }

    /// Run on the calling thread until every sender is gone. Returns the
    /// number of events dispatched.
    pub fn run(&self, thread_name: &str) -> usize {
        let me = self.registry.register_current(thread_name);
        let _run = me.enter(LOOP_OWNER, "run");
        self.pump(&me, None);
        self.dispatched.load(Ordering::Relaxed)
    }

    fn pump(&self, me: &ThreadHandle, limit: Option<usize>) -> usize {
        let mut dispatched = 0;
        while limit.map_or(true, |max| dispatched < max) {
            let Some(HostEvent { descriptor, task }) = self.next_event(me) else {
                break;
            };
            let ctx = DispatchContext { host: self, thread: me };
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                self.watchdog.dispatch(&descriptor, || {
                    let _frame = me.enter(LOOP_OWNER, "dispatch_event");
                    task(&ctx);
                });
            }));
            if outcome.is_err() {
                log::warn!("Dispatch of '{descriptor}' panicked");
            }
            dispatched += 1;
            self.dispatched.fetch_add(1, Ordering::Relaxed);
        }
        dispatched
    }

    fn next_event(&self, me: &ThreadHandle) -> Option<HostEvent> {
        let _next = me.enter(LOOP_OWNER, "next_event");
        let _recv = me.enter("crossbeam_channel::Receiver", "recv");
        me.wait_in("std::thread", "park", || self.rx.recv().ok())
    }
}

/// Sending side of a spawned loop.
pub struct HostHandle {
    tx: Sender<HostEvent>,
    thread: JoinHandle<usize>,
}

impl HostHandle {
    /// Queue an event. Returns false if the loop has exited.
    pub fn post(&self, event: HostEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Close the queue and wait for the loop to drain it. Returns the
    /// number of events dispatched.
    pub fn shutdown(self) -> usize {
        drop(self.tx);
        self.thread.join().unwrap_or_else(|_| {
            log::warn!("Dispatch thread panicked");
            0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::WatchdogConfig;
    use crate::introspection::ThreadIntrospector;
    use crate::report::MemorySink;

    fn host() -> (ShadowRegistry, Arc<DispatchWatchdog>) {
        let registry = ShadowRegistry::new();
        let watchdog = Arc::new(DispatchWatchdog::new(
            WatchdogConfig { startup_dispatch_exclusion: 0, ..WatchdogConfig::default() },
            Arc::new(registry.clone()),
            Arc::new(MemorySink::new()),
        ));
        (registry, watchdog)
    }

    #[test]
    fn test_loop_dispatches_in_order() {
        let (registry, watchdog) = host();
        let handle = DispatchLoop::spawn("dispatch", registry, Arc::clone(&watchdog)).unwrap();
        let (seen_tx, seen_rx) = unbounded();
        for name in ["a", "b", "c"] {
            let seen_tx = seen_tx.clone();
            assert!(handle.post(HostEvent::new(name, move |_| {
                seen_tx.send(name).unwrap();
            })));
        }
        assert_eq!(handle.shutdown(), 3);
        assert_eq!(seen_rx.try_iter().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(watchdog.in_flight(), 0);
    }

    #[test]
    fn test_idle_loop_matches_idle_pattern() {
        let (registry, watchdog) = host();
        let handle = DispatchLoop::spawn("dispatch", registry.clone(), watchdog).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let stack = loop {
            let tid = registry.all_thread_ids().into_iter().next();
            let stack = tid.and_then(|t| registry.stack_of(t).ok()).unwrap_or_default();
            if stack.len() == 4 || std::time::Instant::now() > deadline {
                break stack;
            }
            thread::sleep(Duration::from_millis(1));
        };
        let pattern = WatchdogConfig::default().idle_wait_pattern;
        assert_eq!(stack.len(), 4);
        assert!(pattern.iter().zip(&stack).all(|(p, f)| p.matches(f)));
        handle.shutdown();
    }

    #[test]
    fn test_panicking_task_does_not_kill_loop() {
        let (registry, watchdog) = host();
        let handle = DispatchLoop::spawn("dispatch", registry, Arc::clone(&watchdog)).unwrap();
        handle.post(HostEvent::new("boom", |_| panic!("handler failed")));
        handle.post(HostEvent::new("after", |_| {}));
        assert_eq!(handle.shutdown(), 2);
        assert_eq!(watchdog.in_flight(), 0);
    }

    #[test]
    fn test_nested_pump_runs_following_event() {
        let (registry, watchdog) = host();
        let handle = DispatchLoop::spawn("dispatch", registry, Arc::clone(&watchdog)).unwrap();
        let (seen_tx, seen_rx) = unbounded();
        let outer_tx = seen_tx.clone();
        handle.post(HostEvent::new("dialog", move |ctx| {
            outer_tx.send("open").unwrap();
            assert_eq!(ctx.run_nested(1), 1);
            outer_tx.send("closed").unwrap();
        }));
        handle.post(HostEvent::new("inside", move |_| {
            seen_tx.send("inside").unwrap();
        }));
        assert_eq!(handle.shutdown(), 2);
        assert_eq!(seen_rx.try_iter().collect::<Vec<_>>(), vec!["open", "inside", "closed"]);
    }
}
