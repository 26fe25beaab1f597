//! Periodic process-wide deadlock check, independent of any dispatch.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::dispatcher::panic_message;
use super::timer::ScanTimer;
use crate::analysis::report_deadlocks;
use crate::config::WatchdogConfig;
use crate::domain::{ThreadId, WatchdogError};
use crate::introspection::ThreadIntrospector;
use crate::report::ReportSink;

const THREAD_NAME: &str = "hangwatch-deadlock-scan";

pub struct DeadlockScanner {
    introspector: Arc<dyn ThreadIntrospector>,
    sink: Arc<dyn ReportSink>,
    initial_delay: Duration,
    interval: Duration,
    timer: Mutex<Option<ScanTimer>>,
}

impl DeadlockScanner {
    pub fn new(
        config: &WatchdogConfig,
        introspector: Arc<dyn ThreadIntrospector>,
        sink: Arc<dyn ReportSink>,
    ) -> Self {
        Self {
            introspector,
            sink,
            initial_delay: config.deadlock_initial_delay(),
            interval: config.deadlock_interval(),
            timer: Mutex::new(None),
        }
    }

    /// Check once. Returns the deadlocked threads that were reported.
    pub fn scan_once(&self) -> Vec<ThreadId> {
        scan(self.introspector.as_ref(), self.sink.as_ref())
    }

    /// # Errors
    /// [`WatchdogError::SpawnFailed`] if the thread cannot be created.
    pub fn start(&self) -> Result<(), WatchdogError> {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if timer.is_some() {
            return Ok(());
        }
        let introspector = Arc::clone(&self.introspector);
        let sink = Arc::clone(&self.sink);
        *timer = Some(ScanTimer::spawn(THREAD_NAME, self.initial_delay, self.interval, move || {
            scan(introspector.as_ref(), sink.as_ref());
        })?);
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(timer) = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            timer.stop();
        }
    }
}

fn scan(introspector: &dyn ThreadIntrospector, sink: &dyn ReportSink) -> Vec<ThreadId> {
    match catch_unwind(AssertUnwindSafe(|| report_deadlocks(introspector, sink, None))) {
        Ok(deadlocked) => {
            if !deadlocked.is_empty() {
                log::warn!("{} deadlocked threads", deadlocked.len());
            }
            deadlocked
        }
        Err(payload) => {
            log::warn!(
                "Deadlock scan: {}",
                WatchdogError::AnalysisPanicked(panic_message(payload.as_ref()))
            );
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LockInfo, ThreadInfo, ThreadState};
    use crate::introspection::SnapshotIntrospector;
    use crate::report::MemorySink;

    fn blocked_on(id: u64, lock: u64, owner: u64) -> ThreadInfo {
        let mut info = ThreadInfo::new(ThreadId(id), format!("worker-{id}"));
        info.state = ThreadState::Blocked;
        info.lock = Some(LockInfo::new("app::Account", lock));
        info.lock_owner_id = Some(ThreadId(owner));
        info.lock_owner_name = Some(format!("worker-{owner}"));
        info
    }

    #[test]
    fn test_scan_once_reports_cycle() {
        let threads = Arc::new(SnapshotIntrospector::new());
        threads.set_thread(blocked_on(1, 20, 2));
        threads.set_thread(blocked_on(2, 10, 1));
        let sink = Arc::new(MemorySink::new());
        let scanner = DeadlockScanner::new(&WatchdogConfig::default(), threads, sink.clone());

        assert_eq!(scanner.scan_once(), vec![ThreadId(1), ThreadId(2)]);
        assert!(sink.contains("Deadlock detected"));
        assert!(sink.contains("held by thread (worker-2)"));
        assert!(sink.contains("held by thread (worker-1)"));
    }

    #[test]
    fn test_quiet_without_deadlock() {
        let threads = Arc::new(SnapshotIntrospector::new());
        threads.set_thread(ThreadInfo::new(ThreadId(1), "main"));
        let sink = Arc::new(MemorySink::new());
        let scanner = DeadlockScanner::new(&WatchdogConfig::default(), threads, sink.clone());
        assert!(scanner.scan_once().is_empty());
        assert!(sink.is_empty());
    }

    #[test]
    fn test_start_stop() {
        let scanner = DeadlockScanner::new(
            &WatchdogConfig::default(),
            Arc::new(SnapshotIntrospector::new()),
            Arc::new(MemorySink::new()),
        );
        scanner.start().unwrap();
        scanner.stop();
    }
}
