//! Monitor deadlock detection
//!
//! Builds the wait-for graph from thread snapshots (waiting thread → owner
//! of the lock it waits for) and reports every thread that sits on a cycle.
//! Each thread waits for at most one lock, so the graph is a functional
//! graph and a cycle is found by simply following edges until a thread
//! repeats.

use std::collections::{BTreeSet, HashMap};

use crate::domain::{DispatchId, HangId, RiskLevel, ThreadId, ThreadInfo, ThreadState};
use crate::introspection::ThreadIntrospector;
use crate::report::{ReportEvent, ReportKind, ReportSink};

/// Threads on a lock-wait cycle, sorted by id.
#[must_use]
pub fn find_deadlocked_threads(infos: &[ThreadInfo]) -> Vec<ThreadId> {
    let edges: HashMap<ThreadId, ThreadId> = infos
        .iter()
        .filter(|info| {
            matches!(
                info.state,
                ThreadState::Blocked | ThreadState::Waiting | ThreadState::TimedWaiting
            ) && info.lock.is_some()
        })
        .filter_map(|info| info.lock_owner_id.map(|owner| (info.id, owner)))
        .collect();

    let mut deadlocked = BTreeSet::new();
    for &start in edges.keys() {
        if deadlocked.contains(&start) {
            continue;
        }
        if let Some(cycle) = detect_cycle(&edges, start) {
            deadlocked.extend(cycle);
        }
    }
    deadlocked.into_iter().collect()
}

/// Follow wait edges from `start`; return the cycle reached, if any.
fn detect_cycle(edges: &HashMap<ThreadId, ThreadId>, start: ThreadId) -> Option<Vec<ThreadId>> {
    let mut visited = Vec::new();
    let mut current = start;
    loop {
        if let Some(pos) = visited.iter().position(|t| *t == current) {
            return Some(visited.split_off(pos));
        }
        visited.push(current);
        current = *edges.get(&current)?;
    }
}

/// Ask `introspector` for deadlocked threads and report each one with a
/// full dump. Returns the threads reported.
pub fn report_deadlocks(
    introspector: &dyn ThreadIntrospector,
    sink: &dyn ReportSink,
    dispatch: Option<(DispatchId, Option<HangId>)>,
) -> Vec<ThreadId> {
    let deadlocked = introspector.find_monitor_deadlocked_threads();
    if deadlocked.is_empty() {
        return deadlocked;
    }

    let tag = |event: ReportEvent| match dispatch {
        Some((id, hang)) => event.for_dispatch(id).with_hang(hang),
        None => event,
    };

    sink.emit(tag(ReportEvent::text(
        ReportKind::Deadlock,
        RiskLevel::High,
        "Deadlock detected involving the following threads:",
    )));
    for tid in &deadlocked {
        let info = match introspector.thread_info(*tid, true) {
            Ok(info) => info,
            Err(e) => {
                log::debug!("Deadlocked thread {tid} vanished before reporting: {e}");
                continue;
            }
        };
        sink.emit(tag(ReportEvent::text(
            ReportKind::Deadlock,
            RiskLevel::High,
            format!(
                "Thread #{} {} ({}) waiting on object({}) held by thread ({})",
                info.id.0,
                info.name,
                info.state,
                info.lock_name().unwrap_or_default(),
                info.lock_owner_name.as_deref().unwrap_or("unknown"),
            ),
        )));
        sink.emit(tag(ReportEvent::thread_dump(ReportKind::Deadlock, RiskLevel::High, info)));
    }
    deadlocked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LockInfo;

    fn waiting(id: u64, owner: Option<u64>) -> ThreadInfo {
        let mut info = ThreadInfo::new(ThreadId(id), format!("t{id}"));
        info.state = ThreadState::Blocked;
        info.lock = Some(LockInfo::new("app::Res", id * 100));
        info.lock_owner_id = owner.map(ThreadId);
        info
    }

    #[test]
    fn test_two_thread_cycle() {
        let infos = vec![waiting(1, Some(2)), waiting(2, Some(1))];
        assert_eq!(find_deadlocked_threads(&infos), vec![ThreadId(1), ThreadId(2)]);
    }

    #[test]
    fn test_chain_without_cycle() {
        let infos = vec![waiting(1, Some(2)), waiting(2, Some(3)), ThreadInfo::new(ThreadId(3), "t3")];
        assert!(find_deadlocked_threads(&infos).is_empty());
    }

    #[test]
    fn test_tail_into_cycle_excludes_tail() {
        let infos = vec![waiting(1, Some(2)), waiting(2, Some(3)), waiting(3, Some(2))];
        assert_eq!(find_deadlocked_threads(&infos), vec![ThreadId(2), ThreadId(3)]);
    }

    #[test]
    fn test_runnable_thread_has_no_edge() {
        let mut a = waiting(1, Some(2));
        a.state = ThreadState::Runnable;
        let infos = vec![a, waiting(2, Some(1))];
        assert!(find_deadlocked_threads(&infos).is_empty());
    }

    #[test]
    fn test_unowned_lock_has_no_edge() {
        assert!(find_deadlocked_threads(&[waiting(1, None)]).is_empty());
    }
}
