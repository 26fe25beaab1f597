//! Per-dispatch analysis
//!
//! A [`DispatchAnalyzer`] follows one dispatch from start to end. Every scan
//! tick it samples the watched thread's stack, folds the difference from the
//! previous sample into the dispatch's [`ProfileSynopsis`], and escalates
//! reporting as the dispatch keeps running:
//!
//! ```text
//!   every contention interval  -> contention scan (High)
//!   every forced interval      -> contention scan (High, High, Medium, Info...)
//!                                 forced report
//!                                 deadlock check
//!                                 contention scan (Info)
//!   on dispose, if too long    -> final report
//! ```

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::load_feed::{Subscription, SubscriptionId};
use crate::analysis::{
    apply_diff, report_deadlocks, ContentionReport, ContentionRequest, ContentionScanner,
    ProfileSynopsis, StackDiff,
};
use crate::classification::{ResourceClassifier, RiskClassifier};
use crate::clock::Clock;
use crate::config::WatchdogConfig;
use crate::domain::{
    DispatchId, HangId, IdAllocator, RiskLevel, StackFrame, ThreadId, ThreadInfo, WatchdogError,
    NANOS_PER_MILLI,
};
use crate::introspection::ThreadIntrospector;
use crate::report::{format_elapsed_seconds, format_stack, ReportEvent, ReportKind, ReportSink};

const INDENT: &str = "   ";

/// Everything the analyzers of one watchdog share.
pub struct AnalyzerContext {
    pub config: WatchdogConfig,
    pub clock: Arc<dyn Clock>,
    pub introspector: Arc<dyn ThreadIntrospector>,
    pub classifier: RiskClassifier,
    pub scanner: ContentionScanner,
    pub sink: Arc<dyn ReportSink>,
    pub ids: IdAllocator,
    contention_monitoring: AtomicBool,
}

impl AnalyzerContext {
    pub fn new(
        config: WatchdogConfig,
        clock: Arc<dyn Clock>,
        introspector: Arc<dyn ThreadIntrospector>,
        resources: Arc<dyn ResourceClassifier>,
        sink: Arc<dyn ReportSink>,
    ) -> Self {
        let scanner =
            ContentionScanner::new(&config, Arc::clone(&introspector), resources, Arc::clone(&sink));
        Self {
            classifier: RiskClassifier::from_config(&config),
            config,
            clock,
            introspector,
            scanner,
            sink,
            ids: IdAllocator::new(),
            contention_monitoring: AtomicBool::new(false),
        }
    }

    /// Whether blocked/waited counters are being collected.
    pub fn contention_monitoring(&self) -> bool {
        self.contention_monitoring.load(Ordering::Relaxed)
    }

    pub fn set_contention_monitoring(&self, enabled: bool) {
        self.contention_monitoring.store(enabled, Ordering::Relaxed);
    }
}

/// What a scan tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No stack could be captured
    NoSample,
    /// The watched thread is waiting for work
    Idle,
    /// The dispatch was already disposed
    Finished,
    /// Consecutive samples share no outer frame; rebased without crediting
    Disjoint,
    Analyzed { escalation: Escalation },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Escalation {
    None,
    /// `check` is the number of contention checks run so far, this one
    /// included
    ContentionCheck { check: u64, report: ContentionReport },
    ForcedReport {
        hang: HangId,
        log_count: u32,
        /// Floor of the first contention scan of this crossing
        floor: RiskLevel,
        deadlocked: Vec<ThreadId>,
    },
}

/// Point-in-time view of an analyzer.
#[derive(Debug, Clone)]
pub struct AnalyzerSummary {
    pub dispatch: DispatchId,
    pub hang: Option<HangId>,
    pub elapsed_nanos: u64,
    pub native_nanos: u64,
    pub logged_count: u32,
    pub checked_count: u64,
    pub application_code_seen: bool,
    pub put_itself_into_wait: bool,
    pub load_activity: Vec<String>,
    pub synopsis: ProfileSynopsis,
}

#[derive(Debug, Default)]
struct AnalyzerState {
    dispatch_start: u64,
    previous_nanos: u64,
    previous_stack: Vec<StackFrame>,
    synopsis: ProfileSynopsis,
    native_nanos: u64,
    logged_count: u32,
    checked_count: u64,
    hang: Option<HangId>,
    application_code_seen: bool,
    put_itself_into_wait: bool,
    /// Watched thread's counters at (re)start, when contention monitoring is on
    start_counters: Option<ThreadInfo>,
    subscription: Option<Subscription>,
    load_activity: Vec<String>,
    disposed: bool,
}

impl AnalyzerState {
    fn drain_load_activity(&mut self) {
        if let Some(subscription) = &self.subscription {
            self.load_activity.extend(subscription.drain());
        }
    }
}

pub struct DispatchAnalyzer {
    id: DispatchId,
    watched: ThreadId,
    descriptor: String,
    ctx: Arc<AnalyzerContext>,
    state: Mutex<AnalyzerState>,
}

impl DispatchAnalyzer {
    /// Start analyzing dispatch `id` running on `watched`, baselined at the
    /// current time.
    pub fn new(
        id: DispatchId,
        watched: ThreadId,
        descriptor: impl Into<String>,
        ctx: Arc<AnalyzerContext>,
        subscription: Option<Subscription>,
    ) -> Self {
        let analyzer = Self {
            id,
            watched,
            descriptor: descriptor.into(),
            ctx,
            state: Mutex::new(AnalyzerState { subscription, ..Default::default() }),
        };
        analyzer.reset_timestamp(analyzer.ctx.clock.now_nanos());
        analyzer
    }

    pub fn id(&self) -> DispatchId {
        self.id
    }

    pub fn watched(&self) -> ThreadId {
        self.watched
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        self.lock_state().subscription.as_ref().map(Subscription::id)
    }

    fn lock_state(&self) -> MutexGuard<'_, AnalyzerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Treat the dispatch as if it started at `now`: new elapsed origin, new
    /// baseline sample and new counters baseline. The call tree is kept.
    pub fn reset_timestamp(&self, now: u64) {
        let stack = self.ctx.introspector.stack_of(self.watched).unwrap_or_else(|e| {
            log::debug!("Dispatch {}: no baseline stack: {e}", self.id);
            Vec::new()
        });
        let counters = if self.ctx.contention_monitoring() {
            self.ctx
                .introspector
                .thread_info(self.watched, false)
                .map_err(|e| log::debug!("Dispatch {}: no counters baseline: {e}", self.id))
                .ok()
        } else {
            None
        };

        let mut state = self.lock_state();
        state.dispatch_start = now;
        state.previous_nanos = now;
        state.previous_stack = stack;
        state.start_counters = counters;
    }

    /// Sample the watched thread once and act on what changed.
    pub fn tick(&self) -> TickOutcome {
        let current = match self.ctx.introspector.stack_of(self.watched) {
            Ok(stack) if !stack.is_empty() => stack,
            Ok(_) => {
                self.report_no_sample();
                return TickOutcome::NoSample;
            }
            Err(e) => {
                log::debug!("Dispatch {}: {e}", self.id);
                self.report_no_sample();
                return TickOutcome::NoSample;
            }
        };
        if self.is_idle(&current) {
            return TickOutcome::Idle;
        }

        let now = self.ctx.clock.now_nanos();
        let mut guard = self.lock_state();
        let state = &mut *guard;
        if state.disposed {
            return TickOutcome::Finished;
        }
        state.drain_load_activity();

        self.detect_blocking_wait(state, &current);

        let delta = now.saturating_sub(state.previous_nanos);
        let diff = StackDiff::compute(&state.previous_stack, &current);
        let effects = apply_diff(
            &mut state.synopsis,
            &state.previous_stack,
            &current,
            &diff,
            delta,
            &self.ctx.classifier,
            self.ctx.config.unreasonable_frame_nanos(),
        );

        let Some(effects) = effects else {
            if !state.previous_stack.is_empty() {
                log::warn!("{}", WatchdogError::DisjointSamples { dispatch: self.id });
            }
            state.previous_stack = current;
            state.previous_nanos = now;
            return TickOutcome::Disjoint;
        };
        if effects.missing_crux {
            log::warn!(
                "{}",
                WatchdogError::MissingCruxNode {
                    dispatch: self.id,
                    depth: diff.crux().unwrap_or_default()
                }
            );
        }
        state.native_nanos += effects.native_nanos;
        state.application_code_seen |= effects.application_code_seen;
        state.previous_stack = current;
        state.previous_nanos = now;

        let escalation = self.escalate(state, now);
        TickOutcome::Analyzed { escalation }
    }

    /// End of the dispatch. A dispatch that ran unreasonably long gets a
    /// final report; its hang ID is returned.
    pub fn dispose(&self) -> Option<HangId> {
        let now = self.ctx.clock.now_nanos();
        let mut guard = self.lock_state();
        let state = &mut *guard;
        if state.disposed {
            return None;
        }
        state.disposed = true;
        state.drain_load_activity();
        state.subscription = None;

        if now.saturating_sub(state.dispatch_start) <= self.ctx.config.unreasonable_dispatch_nanos()
        {
            return None;
        }
        let hang = *state.hang.get_or_insert_with(|| self.ctx.ids.next_hang());
        self.log_current_analysis(state, now, false);
        Some(hang)
    }

    pub fn summary(&self) -> AnalyzerSummary {
        let now = self.ctx.clock.now_nanos();
        let mut state = self.lock_state();
        state.drain_load_activity();
        AnalyzerSummary {
            dispatch: self.id,
            hang: state.hang,
            elapsed_nanos: now.saturating_sub(state.dispatch_start),
            native_nanos: state.native_nanos,
            logged_count: state.logged_count,
            checked_count: state.checked_count,
            application_code_seen: state.application_code_seen,
            put_itself_into_wait: state.put_itself_into_wait,
            load_activity: state.load_activity.clone(),
            synopsis: state.synopsis.clone(),
        }
    }

    /// A thread parked in its event loop has nothing to dispatch. Our own
    /// frames on top mean we are looking at ourselves, which is never idle.
    fn is_idle(&self, stack: &[StackFrame]) -> bool {
        let config = &self.ctx.config;
        let Some(top) = stack.first() else {
            return false;
        };
        if config.self_prefixes.iter().any(|p| top.owner.starts_with(p.as_str())) {
            return false;
        }
        let pattern = &config.idle_wait_pattern;
        !pattern.is_empty()
            && stack.len() >= pattern.len()
            && pattern.iter().zip(stack).all(|(p, frame)| p.matches(frame))
    }

    /// The caller of a blocking wait on top of the current sample is
    /// flagged at its height, whatever node already occupies it.
    fn detect_blocking_wait(&self, state: &mut AnalyzerState, current: &[StackFrame]) {
        if current.len() < 2 || !self.ctx.config.blocking_wait_pattern.matches(&current[0]) {
            return;
        }
        let node =
            state.synopsis.get_or_create(current.len() - 2, &current[1], &self.ctx.classifier);
        node.called_blocking_wait = true;
        state.put_itself_into_wait = true;
    }

    fn escalate(&self, state: &mut AnalyzerState, now: u64) -> Escalation {
        let config = &self.ctx.config;
        let elapsed = now.saturating_sub(state.dispatch_start);

        let contention_due =
            config.contention_check_interval_nanos().saturating_mul(state.checked_count + 1);
        if elapsed > contention_due {
            let report = self.scan_contention(state, RiskLevel::High, elapsed);
            state.checked_count += 1;
            return Escalation::ContentionCheck { check: state.checked_count, report };
        }

        let forced_due = config
            .forced_logging_interval_nanos()
            .saturating_mul(u64::from(state.logged_count) + 1);
        if elapsed <= forced_due {
            return Escalation::None;
        }

        let hang = *state.hang.get_or_insert_with(|| self.ctx.ids.next_hang());
        let floor = match state.logged_count {
            0 | 1 => RiskLevel::High,
            2 => RiskLevel::Medium,
            _ => RiskLevel::Info,
        };
        self.scan_contention(state, floor, elapsed);
        self.log_current_analysis(state, now, true);
        let deadlocked = report_deadlocks(
            self.ctx.introspector.as_ref(),
            self.ctx.sink.as_ref(),
            Some((self.id, Some(hang))),
        );
        self.scan_contention(state, RiskLevel::Info, elapsed);

        Escalation::ForcedReport { hang, log_count: state.logged_count, floor, deadlocked }
    }

    fn scan_contention(
        &self,
        state: &AnalyzerState,
        floor: RiskLevel,
        elapsed_nanos: u64,
    ) -> ContentionReport {
        self.ctx.scanner.scan(&ContentionRequest {
            watched: self.watched,
            floor,
            elapsed_nanos,
            dispatch: self.id,
            check_number: state.checked_count,
            hang: state.hang,
        })
    }

    fn report_no_sample(&self) {
        let (id, watched) = (self.id, self.watched);
        self.ctx.sink.emit(
            ReportEvent::lazy(ReportKind::Diagnostic, RiskLevel::Info, move || {
                format!("Failed to obtain stack of {watched} for dispatch {id}")
            })
            .for_dispatch(id),
        );
    }

    /// Emit the full report of this dispatch so far.
    fn log_current_analysis(&self, state: &mut AnalyzerState, now: u64, in_progress: bool) {
        state.logged_count += 1;
        let elapsed = now.saturating_sub(state.dispatch_start);

        let mut text = format!(
            "==== Dispatch {} {} ====\n",
            self.id,
            if in_progress { "in progress" } else { "complete" }
        );
        let _ = writeln!(
            text,
            "{} {} hang {} log count {}:",
            format_elapsed_seconds(elapsed),
            if in_progress {
                "dispatch thread unresponsive and counting..."
            } else {
                "total for dispatch thread to respond."
            },
            state.hang.map_or_else(|| "-".to_string(), |h| h.to_string()),
            state.logged_count
        );
        text.push_str(&self.descriptor);
        if state.put_itself_into_wait {
            text.push_str("\n   blocking wait was called. See details.");
        }
        text.push('\n');

        if self.ctx.contention_monitoring() {
            self.write_counters(state, &mut text);
        }
        let _ = writeln!(text, " * native elapsed time: {}", format_elapsed_seconds(state.native_nanos));

        let _ = writeln!(text, " * load activity: {}", state.load_activity.len());
        for activity in &state.load_activity {
            let _ = writeln!(text, "    {activity}");
        }

        text.push_str(if state.application_code_seen {
            "Application code detected during dispatch.\n"
        } else {
            "No application code detected during dispatch.\n"
        });

        if state.synopsis.is_empty() {
            text.push_str(" No profiling info yet. Last recorded stack:\n");
            text.push_str(&format_stack(&state.previous_stack, INDENT));
        } else {
            let _ = writeln!(
                text,
                "{} <-- Wall clock time, profiled:{}",
                format_elapsed_seconds(elapsed),
                state.synopsis.dump(INDENT)
            );
        }
        let _ = write!(text, "==== end Dispatch {} ====", self.id);

        let priority = if in_progress { RiskLevel::High } else { RiskLevel::Medium };
        self.ctx.sink.emit(
            ReportEvent::text(ReportKind::Dispatch, priority, text)
                .for_dispatch(self.id)
                .with_hang(state.hang),
        );
    }

    /// Blocked/waited deltas since the counters baseline.
    fn write_counters(&self, state: &AnalyzerState, text: &mut String) {
        let Some(start) = &state.start_counters else {
            return;
        };
        let now = match self.ctx.introspector.thread_info(self.watched, false) {
            Ok(info) => info,
            Err(e) => {
                let _ = writeln!(text, " * contention counters unavailable: {e}");
                return;
            }
        };
        let millis = |current: Option<u64>, base: Option<u64>| match (current, base) {
            (Some(c), Some(b)) => format_elapsed_seconds(c.saturating_sub(b) * NANOS_PER_MILLI),
            _ => "unavailable".to_string(),
        };
        let _ = writeln!(
            text,
            " * blocked count: {}",
            now.blocked_count.saturating_sub(start.blocked_count)
        );
        let _ = writeln!(
            text,
            " * blocked elapsed time: {}",
            millis(now.blocked_time_ms, start.blocked_time_ms)
        );
        let _ = writeln!(text, " * wait count: {}", now.waited_count.saturating_sub(start.waited_count));
        let _ = writeln!(
            text,
            " * wait elapsed time: {}",
            millis(now.waited_time_ms, start.waited_time_ms)
        );
    }
}
