//! # hangwatch - Main Entry Point
//!
//! Two subcommands:
//! - **demo**: run a scripted dispatch loop under the watchdog and the
//!   deadlock scanner, reporting through `RUST_LOG`
//! - **threads** (`hangwatch threads <PROCESS>` or `--pid`): dump another
//!   process's threads from `/proc` and check them for deadlocks

#![allow(clippy::cast_precision_loss)]

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hangwatch::analysis::report_deadlocks;
use hangwatch::classification;
use hangwatch::cli::{Args, Command, DemoArgs, ThreadsArgs};
use hangwatch::config::WatchdogConfig;
use hangwatch::domain::RiskLevel;
use hangwatch::export::JsonReportExporter;
use hangwatch::host::workload::{demo_script, spawn_deadlock_pair, DemoWorld};
use hangwatch::host::DispatchLoop;
use hangwatch::introspection::{ProcIntrospector, ShadowRegistry, ThreadIntrospector};
use hangwatch::preflight::run_preflight_checks;
use hangwatch::process_lookup::resolve_pid;
use hangwatch::report::{FanoutSink, LogSink, MemorySink, ReportEvent, ReportKind, ReportSink};
use hangwatch::watchdog::{DeadlockScanner, DispatchWatchdog};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") {
        EXIT_NOPERM
    } else if msg.contains("specify a process name") || msg.contains("invalid configuration") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Demo(demo) => run_demo(demo, args.quiet).await,
        Command::Threads(threads) => run_threads(&threads, args.quiet),
    }
}

fn load_config(path: Option<&Path>) -> Result<WatchdogConfig> {
    match path {
        Some(path) => WatchdogConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(WatchdogConfig::default()),
    }
}

async fn run_demo(args: DemoArgs, quiet: bool) -> Result<()> {
    let config = load_config(args.config.as_deref())?;

    if !quiet {
        println!("hangwatch v{}", env!("CARGO_PKG_VERSION"));
        println!(
            "scan: every {}ms, forced report every {}ms, contention check every {}ms",
            config.scan_interval_ms,
            config.forced_logging_interval_ms,
            config.contention_check_interval_ms
        );
        if let Some(ref export_path) = args.export {
            println!("export: {}", export_path.display());
        }
    }

    // ── Watchdog and scanners ───────────────────────────────────────────
    let registry = ShadowRegistry::new();
    let memory = Arc::new(MemorySink::new());
    let sink: Arc<dyn ReportSink> = Arc::new(FanoutSink::new(vec![
        Arc::new(LogSink) as Arc<dyn ReportSink>,
        Arc::clone(&memory) as Arc<dyn ReportSink>,
    ]));

    let watchdog = Arc::new(DispatchWatchdog::new(
        config.clone(),
        Arc::new(registry.clone()),
        Arc::clone(&sink),
    ));
    watchdog.start()?;
    let deadlocks = DeadlockScanner::new(&config, Arc::new(registry.clone()), sink);
    deadlocks.start()?;

    // ── Workload ────────────────────────────────────────────────────────
    let world = DemoWorld::new(registry.clone());
    if args.with_deadlock {
        spawn_deadlock_pair(&world)?;
        info!("Ledger threads started; expect a deadlock report");
    }
    let host = DispatchLoop::spawn("dispatch", registry, Arc::clone(&watchdog))?;
    for event in demo_script(&world) {
        if !host.post(event) {
            anyhow::bail!("Dispatch thread exited early");
        }
    }

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let started = Instant::now();
    let duration_limit =
        if args.duration > 0 { Some(Duration::from_secs(args.duration)) } else { None };
    let mut exit_reason = "interrupted";

    loop {
        if let Some(limit) = duration_limit {
            if started.elapsed() >= limit {
                exit_reason = "duration limit reached";
                break;
            }
        }

        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(100)) => {}
            _ = &mut ctrl_c => {
                break;
            }
        }
    }

    let dispatched = tokio::task::spawn_blocking(move || host.shutdown())
        .await
        .context("Dispatch thread join failed")?;
    watchdog.stop();
    deadlocks.stop();

    info!(
        "Resource classification coverage: {:.1}%",
        classification::diagnostics().resolution_coverage()
    );

    let reports = memory.take();
    if !quiet {
        eprintln!(
            "\n{}: {:.1}s, {} dispatches, {} reports, {} hangs",
            exit_reason,
            started.elapsed().as_secs_f64(),
            dispatched,
            reports.len(),
            watchdog.context().ids.hang_count(),
        );
    }

    if let Some(export_path) = args.export {
        let mut exporter = JsonReportExporter::new();
        exporter.extend(reports);
        exporter.export_to_file(&export_path)?;
        if !quiet {
            println!("saved: {}", export_path.display());
        }
    }

    Ok(())
}

fn run_threads(args: &ThreadsArgs, quiet: bool) -> Result<()> {
    let pid = resolve_pid(args.process.as_deref(), args.pid)?;
    run_preflight_checks(pid, quiet)?;

    let introspector = ProcIntrospector::new(pid);
    let infos = introspector.thread_infos(true);
    if infos.is_empty() {
        anyhow::bail!("No readable threads in process {pid}");
    }
    if !quiet {
        println!("pid: {pid}");
        println!("threads: {}", infos.len());
    }

    let sink = MemorySink::new();
    for info in infos {
        sink.emit(ReportEvent::thread_dump(ReportKind::Diagnostic, RiskLevel::Info, info));
    }
    let deadlocked = report_deadlocks(&introspector, &sink, None);

    let reports = sink.take();
    for report in &reports {
        println!("{}", report.text);
    }
    if !quiet && deadlocked.is_empty() {
        println!("no deadlocks found");
    }

    if let Some(ref export_path) = args.export {
        let mut exporter = JsonReportExporter::new();
        exporter.extend(reports);
        exporter.export_to_file(export_path)?;
        if !quiet {
            println!("saved: {}", export_path.display());
        }
    }

    Ok(())
}
