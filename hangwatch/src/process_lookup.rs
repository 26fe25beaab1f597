//! Resolve the process to inspect from a name or PID.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

/// A process found by name.
#[derive(Debug)]
pub struct ProcessMatch {
    pub pid: i32,
    pub command: String,
    pub thread_count: usize,
}

/// Find a process by name.
///
/// Searches `/proc` for processes whose command name (from
/// `/proc/<pid>/stat`) or executable basename matches. The executable link
/// is only readable for our own processes, so the command name alone is
/// enough for a match.
///
/// # Errors
/// - No processes found
/// - Multiple processes found (ambiguous)
pub fn find_process_by_name(name: &str) -> Result<ProcessMatch> {
    let own_pid = std::process::id();
    let mut matches: Vec<ProcessMatch> = Vec::new();

    let proc_dir = fs::read_dir("/proc").context("Failed to read /proc")?;

    for entry in proc_dir.flatten() {
        let file_name = entry.file_name();
        let Ok(pid) = file_name.to_string_lossy().parse::<i32>() else {
            continue;
        };
        if u32::try_from(pid).is_ok_and(|p| p == own_pid) {
            continue;
        }

        let Ok(stat_content) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        let Ok(command) = extract_comm(&stat_content) else {
            continue;
        };
        let exe_path = fs::read_link(format!("/proc/{pid}/exe")).ok();

        if is_match(&command, exe_path.as_deref(), name) {
            matches.push(ProcessMatch { pid, command, thread_count: thread_count(pid) });
        }
    }

    match matches.len() {
        0 => bail!(
            "No process matching '{name}' found.\n\
             Check running processes with: ps aux | grep {name}"
        ),
        1 => Ok(matches.remove(0)),
        _ => {
            let list: Vec<String> = matches
                .iter()
                .map(|m| format!("  {} ({}, {} threads)", m.pid, m.command, m.thread_count))
                .collect();
            bail!(
                "Multiple processes match '{name}':\n{}\n\n\
                 Specify PID explicitly: hangwatch threads --pid <PID>",
                list.join("\n")
            )
        }
    }
}

/// PID from an explicit `--pid` or a process name, `--pid` winning.
pub fn resolve_pid(process: Option<&str>, pid: Option<i32>) -> Result<i32> {
    match (pid, process) {
        (Some(pid), _) => Ok(pid),
        (None, Some(name)) => Ok(find_process_by_name(name)?.pid),
        (None, None) => bail!("Specify a process name or --pid <PID>"),
    }
}

fn thread_count(pid: i32) -> usize {
    fs::read_dir(format!("/proc/{pid}/task")).map_or(0, |dir| dir.flatten().count())
}

/// Extract command name from `/proc/<pid>/stat`.
/// Format: "pid (comm) state ..."
fn extract_comm(stat_line: &str) -> Result<String> {
    let open = stat_line.find('(').context("Invalid stat format")?;
    let close = stat_line.rfind(')').context("Invalid stat format")?;
    if open >= close {
        bail!("Invalid stat format");
    }
    Ok(stat_line[open + 1..close].to_string())
}

fn is_match(command: &str, exe_path: Option<&Path>, pattern: &str) -> bool {
    let exe_basename =
        exe_path.and_then(|p| p.file_name()).and_then(|n| n.to_str()).unwrap_or("");
    let pattern_basename =
        Path::new(pattern).file_name().and_then(|n| n.to_str()).unwrap_or(pattern);

    command == pattern_basename
        || (!exe_basename.is_empty() && exe_basename == pattern_basename)
        || command.contains(pattern)
        || (!exe_basename.is_empty() && exe_basename.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_comm_with_parens() {
        // Command names can contain parentheses
        let stat = "1234 (app (v2)) S 1 1234";
        assert_eq!(extract_comm(stat).unwrap(), "app (v2)");
    }

    #[test]
    fn test_extract_comm_invalid() {
        assert!(extract_comm("1234 S 1").is_err());
    }

    #[test]
    fn test_is_match_without_exe() {
        assert!(is_match("editor", None, "editor"));
        assert!(is_match("editor-main", None, "editor"));
        assert!(!is_match("editor", None, "browser"));
    }

    #[test]
    fn test_is_match_on_exe_basename() {
        let exe = Path::new("/usr/bin/my-editor");
        assert!(is_match("main", Some(exe), "/opt/my-editor"));
        assert!(!is_match("main", Some(exe), "other"));
    }

    #[test]
    fn test_resolve_pid_prefers_explicit() {
        assert_eq!(resolve_pid(Some("ignored"), Some(42)).unwrap(), 42);
        assert!(resolve_pid(None, None).is_err());
    }
}
