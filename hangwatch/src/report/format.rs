//! Text rendering shared by every report.

use std::fmt::Write as _;

use crate::domain::{StackFrame, ThreadInfo, ThreadState, NANOS_PER_MILLI, NANOS_PER_SEC};

const NANOS_PER_MIN: u64 = 60 * NANOS_PER_SEC;

/// `SS:mmm.uuuuuu` (seconds, milliseconds, sub-millisecond nanos).
#[must_use]
pub fn format_elapsed_seconds(nanos: u64) -> String {
    format!(
        "{:02}:{:03}.{:06}",
        nanos / NANOS_PER_SEC,
        nanos % NANOS_PER_SEC / NANOS_PER_MILLI,
        nanos % NANOS_PER_MILLI
    )
}

/// `MM:SS:mmm.uuuuuu`
#[must_use]
pub fn format_elapsed_minutes(nanos: u64) -> String {
    format!(
        "{:02}:{:02}:{:03}.{:06}",
        nanos / NANOS_PER_MIN,
        nanos % NANOS_PER_MIN / NANOS_PER_SEC,
        nanos % NANOS_PER_SEC / NANOS_PER_MILLI,
        nanos % NANOS_PER_MILLI
    )
}

/// One frame per line, continuation lines double-indented.
#[must_use]
pub fn format_stack(stack: &[StackFrame], indent: &str) -> String {
    let mut out = String::new();
    for (i, frame) in stack.iter().enumerate() {
        let _ = writeln!(out, "{indent}{}{frame}", if i > 0 { indent } else { "" });
    }
    out
}

/// Full thread dump with no depth limit.
///
/// ```text
/// "dispatch" Id=3 BLOCKED on ui::widget::Canvas@2 owned by "render" Id=4
///     at app::draw::paint(src/draw.rs:10)
///     -  blocked on ui::widget::Canvas@2
///     at app::loop::run(Unknown Source)
///     -  locked app::Model@1
/// ```
#[must_use]
pub fn full_thread_dump(info: &ThreadInfo) -> String {
    let mut out = format!("\"{}\" Id={} {}", info.name, info.id.0, info.state);
    if let Some(lock) = &info.lock {
        let _ = write!(out, " on {lock}");
    }
    if let (Some(name), Some(id)) = (&info.lock_owner_name, info.lock_owner_id) {
        let _ = write!(out, " owned by \"{name}\" Id={}", id.0);
    }
    if info.suspended {
        out.push_str(" (suspended)");
    }
    if info.in_native {
        out.push_str(" (in native)");
    }
    out.push('\n');

    for (depth, frame) in info.stack.iter().enumerate() {
        let _ = writeln!(out, "\tat {frame}");
        if depth == 0 {
            if let Some(lock) = &info.lock {
                match info.state {
                    ThreadState::Blocked => {
                        let _ = writeln!(out, "\t-  blocked on {lock}");
                    }
                    ThreadState::Waiting | ThreadState::TimedWaiting => {
                        let _ = writeln!(out, "\t-  waiting on {lock}");
                    }
                    _ => {}
                }
            }
        }
        for monitor in info.locked_monitors.iter().filter(|m| m.locked_depth == Some(depth)) {
            let _ = writeln!(out, "\t-  locked {monitor}");
        }
    }

    if !info.locked_synchronizers.is_empty() {
        let _ = writeln!(
            out,
            "\n\tNumber of locked synchronizers = {}",
            info.locked_synchronizers.len()
        );
        for lock in &info.locked_synchronizers {
            let _ = writeln!(out, "\t- {lock}");
        }
    }
    out
}
