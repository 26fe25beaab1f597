//! Report events and the sinks that receive them.
//!
//! Analysis code builds [`ReportEvent`]s and hands them to a
//! [`ReportSink`]. Expensive text (call-tree dumps, full thread dumps) can
//! travel as a closure or as a raw snapshot so a sink that drops the event
//! never pays for rendering it.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use super::format::full_thread_dump;
use crate::domain::{DispatchId, HangId, RiskLevel, ThreadInfo};

/// What produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    /// Forced or final report about a long dispatch
    Dispatch,
    /// Thread contention scan output
    Contention,
    /// Deadlock scan output
    Deadlock,
    /// Watchdog self-diagnostics
    Diagnostic,
}

/// Payload of a report.
pub enum ReportBody {
    Text(String),
    /// Rendered only when a sink needs the text
    Lazy(Box<dyn FnOnce() -> String + Send>),
    /// Rendered with [`full_thread_dump`]
    ThreadDump(Box<ThreadInfo>),
}

impl ReportBody {
    #[must_use]
    pub fn render(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Lazy(f) => f(),
            Self::ThreadDump(info) => full_thread_dump(&info),
        }
    }
}

impl fmt::Debug for ReportBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Lazy(_) => f.write_str("Lazy(..)"),
            Self::ThreadDump(info) => f.debug_tuple("ThreadDump").field(&info.id).finish(),
        }
    }
}

/// One unit of report output.
#[derive(Debug)]
pub struct ReportEvent {
    pub priority: RiskLevel,
    pub kind: ReportKind,
    pub dispatch: Option<DispatchId>,
    pub hang: Option<HangId>,
    pub body: ReportBody,
}

impl ReportEvent {
    pub fn text(kind: ReportKind, priority: RiskLevel, text: impl Into<String>) -> Self {
        Self { priority, kind, dispatch: None, hang: None, body: ReportBody::Text(text.into()) }
    }

    pub fn lazy(
        kind: ReportKind,
        priority: RiskLevel,
        f: impl FnOnce() -> String + Send + 'static,
    ) -> Self {
        Self { priority, kind, dispatch: None, hang: None, body: ReportBody::Lazy(Box::new(f)) }
    }

    #[must_use]
    pub fn thread_dump(kind: ReportKind, priority: RiskLevel, info: ThreadInfo) -> Self {
        Self {
            priority,
            kind,
            dispatch: None,
            hang: None,
            body: ReportBody::ThreadDump(Box::new(info)),
        }
    }

    #[must_use]
    pub fn for_dispatch(mut self, dispatch: DispatchId) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    #[must_use]
    pub fn with_hang(mut self, hang: Option<HangId>) -> Self {
        self.hang = hang;
        self
    }

    #[must_use]
    pub fn render(self) -> RenderedReport {
        RenderedReport {
            priority: self.priority,
            kind: self.kind,
            dispatch: self.dispatch,
            hang: self.hang,
            text: self.body.render(),
        }
    }
}

/// A report with its text rendered. This is what gets stored and exported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedReport {
    pub priority: RiskLevel,
    pub kind: ReportKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch: Option<DispatchId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hang: Option<HangId>,
    pub text: String,
}

/// Destination for report output.
pub trait ReportSink: Send + Sync {
    fn emit(&self, event: ReportEvent);
}

// =============================================================================
// SINKS
// =============================================================================

/// Writes reports through the `log` facade (target `hangwatch::report`).
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ReportSink for LogSink {
    fn emit(&self, event: ReportEvent) {
        let report = event.render();
        let prefix = match (report.dispatch, report.hang) {
            (Some(d), Some(h)) => format!("[dispatch {d} hang {h}] "),
            (Some(d), None) => format!("[dispatch {d}] "),
            _ => String::new(),
        };
        if report.priority == RiskLevel::High {
            log::warn!(target: "hangwatch::report", "{prefix}{}", report.text);
        } else {
            log::info!(target: "hangwatch::report", "{prefix}{}", report.text);
        }
    }
}

/// Keeps every rendered report in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    reports: Mutex<Vec<RenderedReport>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RenderedReport>> {
        self.reports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reports(&self) -> Vec<RenderedReport> {
        self.lock().clone()
    }

    pub fn take(&self) -> Vec<RenderedReport> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether any report text contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lock().iter().any(|r| r.text.contains(needle))
    }

    /// Number of reports whose text contains `needle`.
    pub fn count_containing(&self, needle: &str) -> usize {
        self.lock().iter().filter(|r| r.text.contains(needle)).count()
    }

    /// All report texts joined by newlines.
    pub fn joined(&self) -> String {
        self.lock().iter().map(|r| r.text.as_str()).collect::<Vec<_>>().join("\n")
    }
}

impl ReportSink for MemorySink {
    fn emit(&self, event: ReportEvent) {
        let report = event.render();
        self.lock().push(report);
    }
}

/// Renders once and forwards a copy to every inner sink.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ReportSink>>,
}

impl FanoutSink {
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn ReportSink>>) -> Self {
        Self { sinks }
    }
}

impl ReportSink for FanoutSink {
    fn emit(&self, event: ReportEvent) {
        let report = event.render();
        for sink in &self.sinks {
            sink.emit(ReportEvent {
                priority: report.priority,
                kind: report.kind,
                dispatch: report.dispatch,
                hang: report.hang,
                body: ReportBody::Text(report.text.clone()),
            });
        }
    }
}

impl<S: ReportSink + ?Sized> ReportSink for Arc<S> {
    fn emit(&self, event: ReportEvent) {
        (**self).emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ThreadId;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_lazy_body_rendered_on_emit() {
        let sink = MemorySink::new();
        sink.emit(ReportEvent::lazy(ReportKind::Dispatch, RiskLevel::Info, || "tree".into()));
        assert_eq!(sink.reports()[0].text, "tree");
    }

    #[test]
    fn test_thread_dump_body() {
        let sink = MemorySink::new();
        let info = ThreadInfo::new(ThreadId(5), "worker");
        sink.emit(ReportEvent::thread_dump(ReportKind::Deadlock, RiskLevel::High, info));
        assert!(sink.contains("\"worker\" Id=5 RUNNABLE"));
    }

    #[test]
    fn test_fanout_renders_once() {
        let rendered = Arc::new(AtomicBool::new(false));
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let fanout = FanoutSink::new(vec![a.clone(), b.clone()]);

        let flag = Arc::clone(&rendered);
        fanout.emit(
            ReportEvent::lazy(ReportKind::Dispatch, RiskLevel::High, move || {
                assert!(!flag.swap(true, Ordering::SeqCst), "rendered twice");
                "once".into()
            })
            .for_dispatch(DispatchId(3)),
        );
        assert_eq!(a.reports()[0].text, "once");
        assert_eq!(b.reports()[0].dispatch, Some(DispatchId(3)));
    }

    #[test]
    fn test_rendered_report_json_shape() {
        let report = ReportEvent::text(ReportKind::Contention, RiskLevel::Medium, "x")
            .with_hang(Some(HangId(2)))
            .render();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["priority"], "medium");
        assert_eq!(json["kind"], "contention");
        assert_eq!(json["hang"], 2);
        assert!(json.get("dispatch").is_none());
    }
}
