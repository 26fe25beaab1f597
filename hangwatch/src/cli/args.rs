//! CLI argument definitions

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "hangwatch",
    about = "Watch a dispatch thread for hangs, contention and deadlocks",
    after_help = "\
EXAMPLES:
    hangwatch demo                            Run the demo workload for 5s
    hangwatch demo --with-deadlock            Also deadlock two worker threads
    hangwatch demo --export reports.json      Save every report as JSON
    hangwatch threads my-app                  Thread dump of a running process
    sudo hangwatch threads --pid 1234         Include kernel stacks"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a scripted dispatch loop under the watchdog
    Demo(DemoArgs),
    /// Dump the threads of another process and check for deadlocks
    Threads(ThreadsArgs),
}

#[derive(ClapArgs)]
pub struct DemoArgs {
    /// Stop after N seconds (0 = until Ctrl-C)
    #[arg(long, default_value = "5")]
    pub duration: u64,

    /// Watchdog configuration (JSON, missing fields use defaults)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Export reports to file
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// Deadlock two ledger threads so the deadlock scanner has work
    #[arg(long)]
    pub with_deadlock: bool,
}

#[derive(ClapArgs)]
pub struct ThreadsArgs {
    /// Process name to inspect
    #[arg(value_name = "PROCESS")]
    pub process: Option<String>,

    /// Process ID to inspect
    #[arg(short, long)]
    pub pid: Option<i32>,

    /// Export the dump to file
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,
}
