//! Pre-flight checks for `hangwatch threads`
//!
//! Validates that another process can be inspected through `/proc` before
//! building a thread dump. Provides clear, actionable error messages when it
//! can't.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{bail, Context, Result};
use std::path::Path;

/// Run all pre-flight checks for inspecting `pid`.
pub fn run_preflight_checks(pid: i32, quiet: bool) -> Result<()> {
    check_process_exists(pid)?;
    check_proc_access(pid)?;
    if !quiet && !kernel_stacks_readable() {
        eprintln!("warning: not running as root, kernel stacks will be unavailable");
    }
    Ok(())
}

/// Kernel stacks under `/proc/<pid>/task/<tid>/stack` are root-only.
pub fn kernel_stacks_readable() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Check if the target process exists
pub fn check_process_exists(pid: i32) -> Result<()> {
    let proc_path = format!("/proc/{pid}");
    if !Path::new(&proc_path).exists() {
        bail!(
            "Process {pid} not found.\n\n\
             Is the process still running? Check with: ps -p {pid}"
        );
    }
    Ok(())
}

/// Check if the process's thread list can be read
pub fn check_proc_access(pid: i32) -> Result<()> {
    let task_path = format!("/proc/{pid}/task");
    std::fs::read_dir(&task_path).with_context(|| {
        format!(
            "Cannot read {task_path}\n\n\
             This usually means:\n\
             - The process doesn't exist (check: ps -p {pid})\n\
             - Permission denied (run with sudo)\n\
             - /proc is not mounted"
        )
    })?;
    Ok(())
}
