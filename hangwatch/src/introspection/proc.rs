//! `/proc` thread introspection
//!
//! Reads another process's threads from `/proc/<pid>/task/*`: names, kernel
//! scheduling state, context switch counters and (when running as root) the
//! kernel stack. There is no lock information at this level, so the
//! contention and deadlock scans see every thread as lock-free.

use std::fs;
use std::path::PathBuf;

use super::ThreadIntrospector;
use crate::domain::{IntrospectionError, StackFrame, ThreadId, ThreadInfo, ThreadState};

/// Owner used for every kernel stack frame.
pub const KERNEL_OWNER: &str = "kernel";

/// Introspector over one process's `/proc` entries.
#[derive(Debug, Clone)]
pub struct ProcIntrospector {
    pid: i32,
    root: PathBuf,
}

impl ProcIntrospector {
    #[must_use]
    pub fn new(pid: i32) -> Self {
        Self::with_root(pid, "/proc")
    }

    /// Read from an alternate proc mount (used by tests).
    pub fn with_root(pid: i32, root: impl Into<PathBuf>) -> Self {
        Self { pid, root: root.into() }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    fn task_dir(&self) -> PathBuf {
        self.root.join(self.pid.to_string()).join("task")
    }

    fn read_task_file(&self, tid: ThreadId, file: &str) -> Result<String, IntrospectionError> {
        let path = self.task_dir().join(tid.0.to_string()).join(file);
        fs::read_to_string(&path).map_err(|e| IntrospectionError::ProcReadFailed {
            path: path.display().to_string(),
            error: e.to_string(),
        })
    }

    fn kernel_stack(&self, tid: ThreadId) -> Result<Vec<StackFrame>, IntrospectionError> {
        Ok(parse_kernel_stack(&self.read_task_file(tid, "stack")?))
    }
}

impl ThreadIntrospector for ProcIntrospector {
    fn current_thread(&self) -> Result<ThreadId, IntrospectionError> {
        // Resolves to "<pid>/task/<tid>"
        let link = fs::read_link(self.root.join("thread-self"))?;
        let mut parts = link.iter().filter_map(|p| p.to_str());
        let pid = parts.next().and_then(|p| p.parse::<i32>().ok());
        let tid = parts.nth(1).and_then(|t| t.parse::<u64>().ok());
        match (pid, tid) {
            (Some(pid), Some(tid)) if pid == self.pid => Ok(ThreadId(tid)),
            _ => Err(IntrospectionError::UnregisteredThread),
        }
    }

    fn stack_of(&self, tid: ThreadId) -> Result<Vec<StackFrame>, IntrospectionError> {
        self.kernel_stack(tid)
    }

    fn all_thread_ids(&self) -> Vec<ThreadId> {
        let Ok(entries) = fs::read_dir(self.task_dir()) else {
            return Vec::new();
        };
        let mut tids: Vec<ThreadId> = entries
            .filter_map(|entry| {
                let entry = entry.ok()?;
                entry.file_name().to_string_lossy().parse::<u64>().ok().map(ThreadId)
            })
            .collect();
        tids.sort_unstable();
        tids
    }

    fn thread_info(
        &self,
        tid: ThreadId,
        _with_locks: bool,
    ) -> Result<ThreadInfo, IntrospectionError> {
        let comm = self.read_task_file(tid, "comm").map_err(|e| match e {
            IntrospectionError::ProcReadFailed { .. } => IntrospectionError::ThreadNotFound(tid),
            other => other,
        })?;
        let mut info = ThreadInfo::new(tid, comm.trim());

        if let Ok(stat) = self.read_task_file(tid, "stat") {
            if let Some(code) = stat_state_code(&stat) {
                info.state = thread_state_from_code(code);
                info.suspended = matches!(code, 'T' | 't');
            }
        }

        if let Ok(status) = self.read_task_file(tid, "status") {
            let (voluntary, involuntary) = parse_ctxt_switches(&status);
            info.waited_count = voluntary;
            info.blocked_count = involuntary;
        }

        // Needs root; missing kernel stacks are normal
        match self.kernel_stack(tid) {
            Ok(stack) => {
                info.in_native = !stack.is_empty();
                info.stack = stack;
            }
            Err(e) => log::debug!("No kernel stack for {tid}: {e}"),
        }
        Ok(info)
    }
}

/// State character following the `(comm)` field of `/proc/.../stat`.
fn stat_state_code(stat: &str) -> Option<char> {
    let close = stat.rfind(')')?;
    stat[close + 1..].split_whitespace().next()?.chars().next()
}

fn thread_state_from_code(code: char) -> ThreadState {
    match code {
        'R' => ThreadState::Runnable,
        'D' => ThreadState::Blocked,
        'S' | 'I' | 'T' | 't' | 'W' => ThreadState::Waiting,
        'Z' | 'X' | 'x' => ThreadState::Terminated,
        _ => ThreadState::Runnable,
    }
}

/// `(voluntary, involuntary)` context switch counts from `status`.
fn parse_ctxt_switches(status: &str) -> (u64, u64) {
    let field = |name: &str| {
        status
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.trim_start_matches(':').trim().parse::<u64>().ok())
            .unwrap_or(0)
    };
    (field("voluntary_ctxt_switches"), field("nonvoluntary_ctxt_switches"))
}

/// Parse `/proc/.../stack` lines such as `[<0>] do_sys_poll+0x3f8/0x580`.
fn parse_kernel_stack(content: &str) -> Vec<StackFrame> {
    content
        .lines()
        .filter_map(|line| {
            let symbol = line.split_once("] ").map_or(line, |(_, s)| s).trim();
            let name = symbol.split('+').next()?.trim();
            (!name.is_empty()).then(|| StackFrame::native(KERNEL_OWNER, name))
        })
        .collect()
}
