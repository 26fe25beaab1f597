//! Thread contention scan
//!
//! Takes a full snapshot of every thread (with lock detail) and looks for
//! reasons the watched dispatch thread is, or could become, stuck:
//!
//! - **Watched thread**: not runnable, waiting on a lock, which thread owns
//!   it, what the watched thread itself holds, and (for long dispatches
//!   stuck in native code) which other threads are in native code at the
//!   same time.
//! - **Every other thread**: holding a monitor on a protected resource is a
//!   deadlock risk; calling into protected types at all is a possible rule
//!   violation, reported once per thread.
//!
//! Output for each thread is stashed in a [`DeferredBatch`] and only
//! committed if that thread's detected risk reaches the requested floor.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::classification::ResourceClassifier;
use crate::config::WatchdogConfig;
use crate::domain::{DispatchId, HangId, RiskLevel, ThreadId, ThreadInfo, ThreadState};
use crate::introspection::ThreadIntrospector;
use crate::report::{DeferredBatch, ReportEvent, ReportKind, ReportSink};

const INDENT: &str = "   ";

/// Parameters of one scan.
#[derive(Debug, Clone, Copy)]
pub struct ContentionRequest {
    pub watched: ThreadId,
    pub floor: RiskLevel,
    pub elapsed_nanos: u64,
    pub dispatch: DispatchId,
    /// Number of risk checks already run for this dispatch
    pub check_number: u64,
    pub hang: Option<HangId>,
}

/// Outcome of one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentionReport {
    pub threads_examined: usize,
    /// Threads whose detected risk was above `Info`
    pub flagged: Vec<(ThreadId, RiskLevel)>,
    /// Whether any thread's output was committed
    pub emitted: bool,
}

/// Per-thread scratch state.
struct ThreadScan {
    batch: DeferredBatch,
    to_dump: BTreeSet<ThreadId>,
    risk: RiskLevel,
    request: ContentionRequest,
}

impl ThreadScan {
    fn new(request: ContentionRequest) -> Self {
        Self { batch: DeferredBatch::new(), to_dump: BTreeSet::new(), risk: RiskLevel::Info, request }
    }

    fn line(&mut self, text: impl Into<String>) {
        let event = ReportEvent::text(ReportKind::Contention, RiskLevel::Info, text)
            .for_dispatch(self.request.dispatch)
            .with_hang(self.request.hang);
        self.batch.stash(event);
    }

    fn raise(&mut self, risk: RiskLevel) {
        self.risk = self.risk.max(risk);
    }
}

pub struct ContentionScanner {
    introspector: Arc<dyn ThreadIntrospector>,
    resources: Arc<dyn ResourceClassifier>,
    sink: Arc<dyn ReportSink>,
    non_risk_lock_prefixes: Vec<String>,
    unreasonable_dispatch_nanos: u64,
}

impl ContentionScanner {
    pub fn new(
        config: &WatchdogConfig,
        introspector: Arc<dyn ThreadIntrospector>,
        resources: Arc<dyn ResourceClassifier>,
        sink: Arc<dyn ReportSink>,
    ) -> Self {
        Self {
            introspector,
            resources,
            sink,
            non_risk_lock_prefixes: config.non_risk_lock_prefixes.clone(),
            unreasonable_dispatch_nanos: config.unreasonable_dispatch_nanos(),
        }
    }

    pub fn scan(&self, request: &ContentionRequest) -> ContentionReport {
        let infos = self.introspector.thread_infos(true);
        let mut report = ContentionReport { threads_examined: infos.len(), ..Default::default() };

        if infos.is_empty() {
            if request.floor != RiskLevel::Info {
                self.sink.emit(
                    ReportEvent::text(
                        ReportKind::Contention,
                        request.floor,
                        "hangwatch detected no threads.",
                    )
                    .for_dispatch(request.dispatch),
                );
            }
            return report;
        }

        let header = format!(
            "==== Risk Check #{} for dispatch {} ====",
            request.check_number, request.dispatch
        );
        let mut header_printed = false;

        for info in &infos {
            let mut scan = ThreadScan::new(*request);
            if info.id == request.watched {
                self.examine_watched(info, &infos, &mut scan);
            } else {
                self.examine_other(info, &mut scan);
            }
            self.stash_dumps(&infos, &mut scan);

            if scan.risk > RiskLevel::Info {
                report.flagged.push((info.id, scan.risk));
            }
            if scan.risk >= request.floor && !scan.batch.is_empty() {
                if !header_printed {
                    self.emit_divider(&header, request, scan.risk);
                    header_printed = true;
                }
                scan.batch.set_priority(scan.risk);
                scan.batch.commit(self.sink.as_ref());
                report.emitted = true;
            } else {
                scan.batch.discard();
            }
        }

        if header_printed {
            let footer = format!("==== end {} ====", header.trim_matches('=').trim());
            self.emit_divider(&footer, request, RiskLevel::Info);
        }
        report
    }

    fn emit_divider(&self, text: &str, request: &ContentionRequest, priority: RiskLevel) {
        self.sink.emit(
            ReportEvent::text(ReportKind::Contention, priority, text)
                .for_dispatch(request.dispatch)
                .with_hang(request.hang),
        );
    }

    fn examine_watched(&self, info: &ThreadInfo, all: &[ThreadInfo], scan: &mut ThreadScan) {
        let name = &info.name;
        let floor = scan.request.floor;
        scan.line(format!("Thread '{name}' is {}", info.state));

        if info.state != ThreadState::Runnable {
            if floor >= RiskLevel::Medium {
                scan.to_dump.insert(info.id);
            }

            match info.lock_name() {
                Some(lock) => {
                    if !self.non_risk_lock_prefixes.iter().any(|p| lock.starts_with(p.as_str())) {
                        scan.raise(RiskLevel::Medium);
                    }
                    scan.line(format!("{INDENT}on object '{lock}'"));
                }
                None => scan.line(format!("{INDENT}no object")),
            }

            if let Some(owner) = info.lock_owner_id {
                scan.line(format!(
                    "{INDENT}{INDENT}object owned by thread '{}' thread id '{}'",
                    info.lock_owner_name.as_deref().unwrap_or("?"),
                    owner.0
                ));
                if floor >= RiskLevel::Medium {
                    scan.to_dump.insert(owner);
                }
            } else if info.lock.is_some() {
                scan.line(format!("{INDENT}{INDENT}object not currently owned by any thread"));
            }
        }

        if !info.locked_monitors.is_empty() {
            scan.line(format!("Thread '{name}' has locked monitors:"));
            for monitor in &info.locked_monitors {
                scan.line(format!("{INDENT}{name} has locked: {monitor}"));
            }
        }

        if info.in_native && scan.request.elapsed_nanos > self.unreasonable_dispatch_nanos {
            if floor == RiskLevel::High {
                scan.to_dump.insert(info.id);
            }
            scan.line(format!("Thread '{name}' is in native code, along with threads:"));
            let mut concurrent_native = false;
            for other in all.iter().filter(|o| o.in_native && o.id != info.id) {
                concurrent_native = true;
                if floor == RiskLevel::High {
                    scan.to_dump.insert(other.id);
                }
                scan.line(format!("{INDENT}thread '{}' {}", other.name, other.state));
                for monitor in &other.locked_monitors {
                    scan.line(format!("{INDENT}{INDENT}has locked: {monitor}"));
                }
            }
            if concurrent_native {
                scan.raise(RiskLevel::Medium);
            } else {
                scan.line(format!("{INDENT}no other threads"));
            }
        }
    }

    fn examine_other(&self, info: &ThreadInfo, scan: &mut ThreadScan) {
        let name = &info.name;

        if !info.locked_monitors.is_empty() {
            scan.line(format!("Thread '{name}' has locked items:"));
            for monitor in &info.locked_monitors {
                let type_name = &monitor.lock.type_name;
                scan.line(format!("{INDENT}{monitor}"));
                match self.resources.is_protected(type_name) {
                    Ok(true) => {
                        scan.raise(RiskLevel::High);
                        scan.to_dump.insert(info.id);
                        let site = monitor
                            .locked_frame
                            .as_ref()
                            .map_or_else(|| "unknown frame".to_string(), ToString::to_string);
                        scan.line(format!(
                            "{INDENT}{INDENT}DEADLOCK RISK: protected resource '{type_name}' \
                             locked by thread '{name}' --at--> {site}"
                        ));
                    }
                    Ok(false) => {}
                    Err(e) => scan.line(format!("{INDENT}{type_name} {e}")),
                }
            }
        }

        if scan.to_dump.contains(&info.id) {
            return;
        }
        for frame in &info.stack {
            match self.resources.is_protected(&frame.owner) {
                Ok(true) => {
                    // Reported once per thread
                    scan.raise(RiskLevel::Medium);
                    scan.line(format!("Thread '{name}' possible rule violation by calling:"));
                    scan.line(format!(
                        "{INDENT} protected resource '{}' method '{}'",
                        frame.owner, frame.method
                    ));
                    scan.to_dump.insert(info.id);
                    break;
                }
                Ok(false) => {}
                Err(e) => scan.line(format!("Thread '{name}' {} {e}", frame.owner)),
            }
        }
    }

    /// Append full dumps of every marked thread, taken from this scan's
    /// snapshot where possible.
    fn stash_dumps(&self, all: &[ThreadInfo], scan: &mut ThreadScan) {
        if scan.to_dump.is_empty() {
            return;
        }
        scan.line("");
        let to_dump = std::mem::take(&mut scan.to_dump);
        for tid in to_dump {
            let info = match all.iter().find(|i| i.id == tid) {
                Some(info) => info.clone(),
                None => match self.introspector.thread_info(tid, true) {
                    Ok(info) => info,
                    Err(e) => {
                        log::debug!("Cannot dump {tid}: {e}");
                        continue;
                    }
                },
            };
            scan.batch.stash(
                ReportEvent::thread_dump(ReportKind::Contention, RiskLevel::Info, info)
                    .for_dispatch(scan.request.dispatch)
                    .with_hang(scan.request.hang),
            );
        }
    }
}
