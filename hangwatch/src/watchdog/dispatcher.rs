//! The dispatch watchdog
//!
//! Keeps the queue of in-flight dispatches (outermost first) and a scan
//! thread that ticks the innermost one. Only the innermost dispatch can be
//! stuck: a nested dispatch suspends every dispatch outside it. When a
//! nested dispatch ends, the dispatches around it on the same thread are
//! rebased so they are not charged for its time.
//!
//! Nothing in here may disturb the host. Failures and panics inside start,
//! end and tick are logged and swallowed.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::analyzer::{AnalyzerContext, DispatchAnalyzer, TickOutcome};
use super::hook::{DispatchGuard, DispatchHook, DispatchToken};
use super::load_feed::LoadActivityFeed;
use super::timer::ScanTimer;
use crate::classification::{PrefixResourceClassifier, ResourceClassifier};
use crate::clock::{Clock, MonotonicClock};
use crate::config::WatchdogConfig;
use crate::domain::{DispatchId, HangId, RiskLevel, WatchdogError};
use crate::introspection::ThreadIntrospector;
use crate::report::{ReportEvent, ReportKind, ReportSink};

const SCAN_THREAD_NAME: &str = "hangwatch-dispatch-scan";

pub struct WatchdogBuilder {
    config: WatchdogConfig,
    introspector: Arc<dyn ThreadIntrospector>,
    sink: Arc<dyn ReportSink>,
    clock: Option<Arc<dyn Clock>>,
    resources: Option<Arc<dyn ResourceClassifier>>,
    feed: Option<Arc<LoadActivityFeed>>,
}

impl WatchdogBuilder {
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn resource_classifier(mut self, resources: Arc<dyn ResourceClassifier>) -> Self {
        self.resources = Some(resources);
        self
    }

    #[must_use]
    pub fn load_feed(mut self, feed: Arc<LoadActivityFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn build(self) -> DispatchWatchdog {
        let resources: Arc<dyn ResourceClassifier> = match self.resources {
            Some(resources) => resources,
            None => Arc::new(PrefixResourceClassifier::from_config(&self.config)),
        };
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(MonotonicClock::new()),
        };
        let ctx = Arc::new(AnalyzerContext::new(
            self.config,
            clock,
            self.introspector,
            resources,
            self.sink,
        ));
        init_contention_monitoring(&ctx);

        DispatchWatchdog {
            shared: Arc::new(Shared {
                ctx,
                feed: self.feed.unwrap_or_default(),
                queue: Mutex::new(VecDeque::new()),
            }),
            timer: Mutex::new(None),
        }
    }
}

/// Turn on blocked/waited accounting if configured and possible, and say
/// how that went.
fn init_contention_monitoring(ctx: &AnalyzerContext) {
    if !ctx.config.monitor_thread_contention {
        return;
    }
    let introspector = &ctx.introspector;
    let outcome = if !introspector.contention_monitoring_supported() {
        "Thread contention monitoring is not supported by this introspector.".to_string()
    } else {
        match introspector.enable_contention_monitoring() {
            Ok(()) => {
                ctx.set_contention_monitoring(true);
                "Thread contention monitoring is supported and has been enabled.".to_string()
            }
            Err(e) => format!("Thread contention monitoring is supported but failed to enable: {e}"),
        }
    };
    log::info!("{outcome}");
    ctx.sink.emit(ReportEvent::text(ReportKind::Diagnostic, RiskLevel::Info, outcome));
}

/// State reachable from the scan thread.
struct Shared {
    ctx: Arc<AnalyzerContext>,
    feed: Arc<LoadActivityFeed>,
    /// Outermost first
    queue: Mutex<VecDeque<Arc<DispatchAnalyzer>>>,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, VecDeque<Arc<DispatchAnalyzer>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn scan_tick(&self) -> Option<TickOutcome> {
        let innermost = self.queue().back().cloned()?;
        match catch_unwind(AssertUnwindSafe(|| innermost.tick())) {
            Ok(outcome) => Some(outcome),
            Err(payload) => {
                log::warn!(
                    "Dispatch {}: {}",
                    innermost.id(),
                    WatchdogError::AnalysisPanicked(panic_message(payload.as_ref()))
                );
                None
            }
        }
    }
}

pub struct DispatchWatchdog {
    shared: Arc<Shared>,
    timer: Mutex<Option<ScanTimer>>,
}

impl DispatchWatchdog {
    pub fn builder(
        config: WatchdogConfig,
        introspector: Arc<dyn ThreadIntrospector>,
        sink: Arc<dyn ReportSink>,
    ) -> WatchdogBuilder {
        WatchdogBuilder { config, introspector, sink, clock: None, resources: None, feed: None }
    }

    pub fn new(
        config: WatchdogConfig,
        introspector: Arc<dyn ThreadIntrospector>,
        sink: Arc<dyn ReportSink>,
    ) -> Self {
        Self::builder(config, introspector, sink).build()
    }

    pub fn context(&self) -> &Arc<AnalyzerContext> {
        &self.shared.ctx
    }

    pub fn load_feed(&self) -> &Arc<LoadActivityFeed> {
        &self.shared.feed
    }

    /// Number of dispatches currently being analyzed.
    pub fn in_flight(&self) -> usize {
        self.shared.queue().len()
    }

    pub fn innermost(&self) -> Option<Arc<DispatchAnalyzer>> {
        self.shared.queue().back().cloned()
    }

    /// A dispatch is about to run on the calling thread.
    pub fn on_dispatch_start(&self, descriptor: &str) -> DispatchToken {
        let ctx = &self.shared.ctx;
        let id = ctx.ids.next_dispatch();
        if id.0 <= ctx.config.startup_dispatch_exclusion {
            log::debug!("Dispatch {id} not analyzed (startup)");
            return DispatchToken { id, analyzed: false };
        }

        let queued = catch_unwind(AssertUnwindSafe(|| self.queue_analyzer(id, descriptor)));
        let analyzed = match queued {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                log::warn!("Problem preparing dispatch {id}, not analyzed: {e}");
                false
            }
            Err(payload) => {
                log::warn!(
                    "Problem preparing dispatch {id}, not analyzed: {}",
                    WatchdogError::AnalysisPanicked(panic_message(payload.as_ref()))
                );
                false
            }
        };
        DispatchToken { id, analyzed }
    }

    fn queue_analyzer(&self, id: DispatchId, descriptor: &str) -> Result<(), WatchdogError> {
        let ctx = &self.shared.ctx;
        let watched = ctx.introspector.current_thread()?;
        let analyzer = DispatchAnalyzer::new(
            id,
            watched,
            descriptor,
            Arc::clone(ctx),
            Some(self.shared.feed.subscribe()),
        );
        self.shared.queue().push_back(Arc::new(analyzer));
        Ok(())
    }

    /// The dispatch described by `token` has finished. Returns its hang ID
    /// if it was reported as hung.
    pub fn on_dispatch_end(&self, token: DispatchToken) -> Option<HangId> {
        if !token.analyzed {
            return None;
        }
        match catch_unwind(AssertUnwindSafe(|| self.finish_innermost())) {
            Ok(Ok(hang)) => hang,
            Ok(Err(e)) => {
                log::warn!("Dispatch {} end: {e}", token.id);
                None
            }
            Err(payload) => {
                log::warn!(
                    "Dispatch {} end: {}",
                    token.id,
                    WatchdogError::AnalysisPanicked(panic_message(payload.as_ref()))
                );
                None
            }
        }
    }

    fn finish_innermost(&self) -> Result<Option<HangId>, WatchdogError> {
        let finished = self.shared.queue().pop_back().ok_or(WatchdogError::EmptyDispatchQueue)?;
        if let Some(subscription) = finished.subscription_id() {
            self.shared.feed.unsubscribe(subscription);
        }
        let hang = finished.dispose();

        // Outer dispatches waited on this one; charge them from now on
        let now = self.shared.ctx.clock.now_nanos();
        let outer: Vec<_> = self
            .shared
            .queue()
            .iter()
            .filter(|a| a.watched() == finished.watched())
            .cloned()
            .collect();
        for analyzer in outer {
            analyzer.reset_timestamp(now);
        }
        Ok(hang)
    }

    /// Tick the innermost dispatch once. `None` if nothing is in flight or
    /// the tick failed.
    pub fn scan_tick(&self) -> Option<TickOutcome> {
        self.shared.scan_tick()
    }

    /// Run `f` as one dispatch.
    pub fn dispatch<R>(&self, descriptor: &str, f: impl FnOnce() -> R) -> R {
        let _guard = DispatchGuard::new(self, descriptor);
        f()
    }

    /// Start the scan thread. Starting twice is a no-op.
    ///
    /// # Errors
    /// [`WatchdogError::SpawnFailed`] if the thread cannot be created.
    pub fn start(&self) -> Result<(), WatchdogError> {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if timer.is_some() {
            return Ok(());
        }
        let config = &self.shared.ctx.config;
        let shared = Arc::clone(&self.shared);
        *timer = Some(ScanTimer::spawn(
            SCAN_THREAD_NAME,
            config.scan_initial_delay(),
            config.scan_interval(),
            move || {
                shared.scan_tick();
            },
        )?);
        log::info!(
            "Dispatch watchdog started (scan every {:?}, forced report every {} ms)",
            config.scan_interval(),
            config.forced_logging_interval_ms
        );
        Ok(())
    }

    pub fn stop(&self) {
        let timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(timer) = timer {
            timer.stop();
            log::info!("Dispatch watchdog stopped");
        }
    }
}

impl DispatchHook for DispatchWatchdog {
    fn before_dispatch(&self, descriptor: &str) -> DispatchToken {
        self.on_dispatch_start(descriptor)
    }

    fn after_dispatch(&self, token: DispatchToken) -> Option<HangId> {
        self.on_dispatch_end(token)
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::analysis::ProfileSynopsis;
    use crate::clock::ManualClock;
    use crate::domain::{StackFrame, ThreadId};
    use crate::introspection::SnapshotIntrospector;
    use crate::report::MemorySink;

    const DISPATCH_THREAD: ThreadId = ThreadId(1);

    fn watchdog(config: WatchdogConfig) -> (DispatchWatchdog, Arc<SnapshotIntrospector>, Arc<ManualClock>) {
        let threads = Arc::new(SnapshotIntrospector::new());
        threads.set_current(DISPATCH_THREAD);
        threads.set_stack(DISPATCH_THREAD, vec![StackFrame::new("lib::ui", "run")]);
        let clock = Arc::new(ManualClock::new());
        let watchdog = DispatchWatchdog::builder(config, threads.clone(), Arc::new(MemorySink::new()))
            .clock(clock.clone())
            .build();
        (watchdog, threads, clock)
    }

    fn no_exclusion() -> WatchdogConfig {
        WatchdogConfig { startup_dispatch_exclusion: 0, ..WatchdogConfig::default() }
    }

    #[test]
    fn test_startup_dispatches_excluded() {
        let (watchdog, _, _) = watchdog(WatchdogConfig::default());
        let first = watchdog.on_dispatch_start("a");
        let second = watchdog.on_dispatch_start("b");
        let third = watchdog.on_dispatch_start("c");
        assert!(!first.analyzed && !second.analyzed);
        assert!(third.analyzed);
        assert_eq!(third.id, DispatchId(3));
        assert_eq!(watchdog.in_flight(), 1);

        assert_eq!(watchdog.on_dispatch_end(third), None);
        watchdog.on_dispatch_end(second);
        watchdog.on_dispatch_end(first);
        assert_eq!(watchdog.in_flight(), 0);
    }

    #[test]
    fn test_unknown_thread_not_analyzed() {
        let (watchdog, _, _) = watchdog(no_exclusion());
        let threads = SnapshotIntrospector::new();
        let other = DispatchWatchdog::new(no_exclusion(), Arc::new(threads), Arc::new(MemorySink::new()));
        assert!(!other.on_dispatch_start("x").analyzed);
        assert!(watchdog.on_dispatch_start("y").analyzed);
    }

    #[test]
    fn test_end_with_empty_queue_is_harmless() {
        let (watchdog, _, _) = watchdog(no_exclusion());
        let token = DispatchToken { id: DispatchId(9), analyzed: true };
        assert_eq!(watchdog.on_dispatch_end(token), None);
    }

    #[test]
    fn test_tick_targets_innermost() {
        let (watchdog, _, _) = watchdog(no_exclusion());
        assert!(watchdog.scan_tick().is_none());
        let _outer = watchdog.on_dispatch_start("outer");
        let _inner = watchdog.on_dispatch_start("inner");
        assert_eq!(watchdog.innermost().unwrap().descriptor(), "inner");
        assert!(watchdog.scan_tick().is_some());
    }

    #[test]
    fn test_nested_end_rebases_outer() {
        let (watchdog, _, clock) = watchdog(no_exclusion());
        let outer = watchdog.on_dispatch_start("outer");
        clock.advance(Duration::from_millis(100));
        let inner = watchdog.on_dispatch_start("inner");
        clock.advance(Duration::from_secs(3));
        watchdog.on_dispatch_end(inner);

        let summary = watchdog.innermost().unwrap().summary();
        assert_eq!(summary.dispatch, outer.id);
        assert_eq!(summary.elapsed_nanos, 0);
        assert_eq!(summary.synopsis, ProfileSynopsis::new());
    }

    #[test]
    fn test_dispatch_wrapper_reports_hang() {
        let (watchdog, _, clock) = watchdog(no_exclusion());
        let value = watchdog.dispatch("slow", || {
            clock.advance(Duration::from_millis(500));
            7
        });
        assert_eq!(value, 7);
        assert_eq!(watchdog.in_flight(), 0);
        assert_eq!(watchdog.context().ids.hang_count(), 1);
    }

    #[test]
    fn test_load_feed_subscriptions_follow_dispatches() {
        let (watchdog, _, _) = watchdog(no_exclusion());
        let token = watchdog.on_dispatch_start("open");
        assert_eq!(watchdog.load_feed().subscriber_count(), 1);
        watchdog.load_feed().publish("app::plugins::spellcheck");
        assert_eq!(watchdog.innermost().unwrap().summary().load_activity.len(), 1);
        watchdog.on_dispatch_end(token);
        assert_eq!(watchdog.load_feed().subscriber_count(), 0);
    }

    #[test]
    fn test_contention_monitoring_enabled_when_supported() {
        let threads = Arc::new(SnapshotIntrospector::new().with_contention_support());
        let sink = Arc::new(MemorySink::new());
        let watchdog = DispatchWatchdog::new(WatchdogConfig::default(), threads.clone(), sink.clone());
        assert!(watchdog.context().contention_monitoring());
        assert!(threads.contention_monitoring_enabled());
        assert!(sink.contains("has been enabled"));

        let sink = Arc::new(MemorySink::new());
        let unsupported =
            DispatchWatchdog::new(WatchdogConfig::default(), Arc::new(SnapshotIntrospector::new()), sink.clone());
        assert!(!unsupported.context().contention_monitoring());
        assert!(sink.contains("not supported"));
    }

    #[test]
    fn test_start_stop_scan_thread() {
        let (watchdog, _, _) = watchdog(WatchdogConfig {
            scan_initial_delay_ms: 0,
            ..no_exclusion()
        });
        watchdog.start().unwrap();
        watchdog.start().unwrap();
        watchdog.stop();
        watchdog.stop();
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");
    }
}
